use duramq_core::config::PostgresConfig;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Create a PostgreSQL connection pool from config. Schema bootstrap is not
/// this crate's concern (spec Non-goals) — the pool assumes the tables in
/// `crate::schema` already exist.
pub async fn init_pg_pool(config: &PostgresConfig) -> Result<PgPool, sqlx::Error> {
    let url = config.connection_string();
    let masked = mask_credentials(&url);
    info!("Connecting to PostgreSQL: {}", masked);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&url)
        .await?;

    info!("PostgreSQL connected, pool size {}", config.max_connections);
    Ok(pool)
}

fn mask_credentials(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
        format!("{}***@{}", &url[..scheme_end], &url[at_pos + 1..])
    } else {
        url.to_string()
    }
}

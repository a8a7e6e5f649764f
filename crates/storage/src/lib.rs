pub mod codec;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod pg;
pub mod pool;
pub mod schema;
pub mod types;

pub use error::StorageError;
pub use gateway::{new_lock_token, StorageGateway};
pub use memory::InMemoryStorageGateway;
pub use pg::PgStorageGateway;
pub use pool::init_pg_pool;
pub use types::*;

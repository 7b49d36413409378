use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Produces ids for approvals and step responses.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Random v4 UUIDs.
pub fn uuid_generator() -> IdGenerator {
    Arc::new(|| uuid::Uuid::new_v4().to_string())
}

/// `prefix-0`, `prefix-1`, ... Deterministic, for tests and demos.
pub fn counter_generator(prefix: impl Into<String>) -> IdGenerator {
    let prefix = prefix.into();
    let next = AtomicU64::new(0);
    Arc::new(move || format!("{prefix}-{}", next.fetch_add(1, Ordering::Relaxed)))
}

//! Cache tier access: collector checkpoints, rolling candle context,
//! distributed locks and quota counters.

pub mod context;
pub mod lock;
pub mod quota;
pub mod state;

pub use context::ContextCache;
pub use lock::DistributedLock;
pub use quota::QuotaCounters;
pub use state::CheckpointStore;

use anyhow::{Context as _, Result};
use redis::aio::ConnectionManager;

/// Builds the shared, thread-safe cache connection. The manager reconnects
/// on its own; callers treat every command failure as transient.
pub async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url).context("Invalid Redis URL")?;
    ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")
}

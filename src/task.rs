use std::future::Future;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::warn;

/// Runs `future` in the background. A failure is logged under `task` rather than
/// surfacing to whoever submitted it.
pub fn spawn_logged<F>(task: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = future.await {
            warn!(task, "Background task failed: {:#}", e);
        }
    })
}

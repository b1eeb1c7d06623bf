use std::{future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Run an I/O future under a deadline, labelling both the timeout and any inner error with
/// `action` (phrased as a gerund, e.g. "writing response header").
pub async fn with_deadline<F, T, E>(deadline: Duration, future: F, action: &str) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    match timeout(deadline, future).await {
        Ok(result) => result.with_context(|| format!("failed while {action}")),
        Err(_) => Err(anyhow!("timed out {action}")),
    }
}

pub async fn write_all_with_timeout<S>(
    stream: &mut S,
    data: &[u8],
    deadline: Duration,
    action: &str,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    with_deadline(deadline, stream.write_all(data), action).await?;
    with_deadline(deadline, stream.flush(), action).await
}

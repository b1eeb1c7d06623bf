use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::io_util::{with_deadline, write_all_with_timeout};

/// Write a minimal proxy-generated response (used only for errors).
pub async fn send_status<S>(
    stream: &mut S,
    status: StatusCode,
    body: &[u8],
    timeout_dur: Duration,
) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    let reason_text = status.canonical_reason().unwrap_or("Unknown");
    let header = format!(
        "HTTP/1.0 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n",
        status.as_u16(),
        reason_text,
        body.len()
    );
    write_all_with_timeout(
        stream,
        header.as_bytes(),
        timeout_dur,
        "writing response header",
    )
    .await?;
    let mut written = header.len();
    if !body.is_empty() {
        write_all_with_timeout(stream, body, timeout_dur, "writing response body").await?;
        written += body.len();
    }
    Ok(written)
}

/// Forward response bytes to the client without modification.
pub async fn relay<S>(stream: &mut S, bytes: &[u8], timeout_dur: Duration) -> Result<usize>
where
    S: AsyncWrite + Unpin,
{
    write_all_with_timeout(stream, bytes, timeout_dur, "relaying response to client").await?;
    Ok(bytes.len())
}

pub async fn shutdown_stream<S>(stream: &mut S, timeout_dur: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    with_deadline(timeout_dur, stream.shutdown(), "shutting down client stream").await
}

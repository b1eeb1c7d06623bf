use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{self as tokio_time, timeout, timeout_at};
use tracing::{debug, trace};

use crate::settings::Settings;

pub const USER_AGENT: &str = concat!("cacheproxy/", env!("CARGO_PKG_VERSION"));

const READ_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    Connect,
    Send,
    Read,
}

impl fmt::Display for FetchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FetchPhase::Connect => "connecting to",
            FetchPhase::Send => "sending request to",
            FetchPhase::Read => "reading response from",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out {phase} {host}:{port}")]
    Timeout {
        host: String,
        port: u16,
        phase: FetchPhase,
    },
    #[error("connection to {host}:{port} failed while {phase}")]
    ConnectionFailed {
        host: String,
        port: u16,
        phase: FetchPhase,
        #[source]
        source: io::Error,
    },
    #[error("origin {host}:{port} closed the connection without sending a response")]
    EmptyResponse { host: String, port: u16 },
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout { .. } => "timeout",
            FetchError::ConnectionFailed { .. } => "connection_failed",
            FetchError::EmptyResponse { .. } => "empty_response",
        }
    }
}

/// Raw origin response bytes, exactly as received.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub body: Bytes,
    /// The origin kept sending past the configured size limit; `body` holds the first
    /// `max_response_size` bytes only.
    pub truncated: bool,
}

/// Opens one connection per fetch and reads the response until the origin closes it.
#[derive(Debug, Clone)]
pub struct OriginFetcher {
    connect_timeout: Duration,
    read_timeout: Duration,
    max_response_size: usize,
}

impl OriginFetcher {
    pub fn new(connect_timeout: Duration, read_timeout: Duration, max_response_size: usize) -> Self {
        Self {
            connect_timeout,
            read_timeout,
            max_response_size,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.upstream_connect_timeout(),
            settings.upstream_read_timeout(),
            settings.max_response_size,
        )
    }

    pub async fn fetch(
        &self,
        host: &str,
        port: u16,
        path: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let start = Instant::now();
        let result = self.fetch_inner(host, port, path).await;
        crate::metrics::record_origin_fetch(start.elapsed());
        if let Err(err) = &result {
            crate::metrics::record_origin_error(err.kind());
        }
        result
    }

    async fn fetch_inner(
        &self,
        host: &str,
        port: u16,
        path: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let fail = |phase: FetchPhase, err: io::Error| classify_io_error(host, port, phase, err);
        let elapsed = |phase: FetchPhase| FetchError::Timeout {
            host: host.to_string(),
            port,
            phase,
        };

        let mut stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| elapsed(FetchPhase::Connect))?
            .map_err(|err| fail(FetchPhase::Connect, err))?;
        if let Err(err) = stream.set_nodelay(true) {
            trace!(host, port, error = %err, "failed to set TCP_NODELAY on origin stream");
        }
        debug!(host, port, path, "connected to origin");

        let request = build_origin_request(host, port, path);
        timeout(self.read_timeout, stream.write_all(&request))
            .await
            .map_err(|_| elapsed(FetchPhase::Send))?
            .map_err(|err| fail(FetchPhase::Send, err))?;

        // One deadline for the whole read phase; a trickling origin cannot extend it.
        let deadline = tokio_time::Instant::now() + self.read_timeout;
        let mut body = BytesMut::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        let mut truncated = false;
        loop {
            if body.len() == self.max_response_size {
                truncated = true;
                break;
            }
            let n = timeout_at(deadline, stream.read(&mut chunk))
                .await
                .map_err(|_| elapsed(FetchPhase::Read))?
                .map_err(|err| fail(FetchPhase::Read, err))?;
            if n == 0 {
                break;
            }
            let room = self.max_response_size - body.len();
            if n > room {
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk[..n]);
            trace!(host, port, read = n, total = body.len(), "read from origin");
        }

        if body.is_empty() {
            return Err(FetchError::EmptyResponse {
                host: host.to_string(),
                port,
            });
        }

        Ok(FetchedResponse {
            body: body.freeze(),
            truncated,
        })
    }
}

fn classify_io_error(host: &str, port: u16, phase: FetchPhase, err: io::Error) -> FetchError {
    if err.kind() == io::ErrorKind::TimedOut {
        FetchError::Timeout {
            host: host.to_string(),
            port,
            phase,
        }
    } else {
        FetchError::ConnectionFailed {
            host: host.to_string(),
            port,
            phase,
            source: err,
        }
    }
}

/// Build the fixed-shape HTTP/1.0 request sent to origin servers.
pub fn build_origin_request(host: &str, port: u16, path: &str) -> Vec<u8> {
    let mut authority = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if port != 80 {
        authority.push(':');
        authority.push_str(&port.to_string());
    }
    format!(
        "GET {path} HTTP/1.0\r\n\
         Host: {authority}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Accept: */*\r\n\
         Accept-Encoding: identity\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .into_bytes()
}

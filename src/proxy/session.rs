use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Result, bail};
use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::{Instant as Deadline, timeout_at};
use tracing::{debug, trace, warn};

use crate::logging::AccessLogBuilder;
use crate::metrics::{self, InflightGuard};

use super::AppContext;
use super::cache::{CacheError, CacheKey};
use super::origin::FetchError;
use super::request::{ParseError, ProxyRequest, parse_request};
use super::respond::{relay, send_status, shutdown_stream};

const REQUEST_READ_CHUNK: usize = 4096;

/// Where a session is in the request pipeline. `Closed` is reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingRequest,
    Parsed,
    CacheHit,
    CacheMiss,
    Fetching,
    Relaying,
    Closed,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client closed the connection without sending anything.
    Empty,
    /// Reading the request failed or timed out.
    ClientError,
    Rejected(&'static str),
    CacheHit { bytes: u64 },
    Fetched { bytes: u64, cached: bool },
    FetchFailed(&'static str),
    /// The response was ready but the client went away while it was being written.
    RelayFailed,
}

impl SessionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Empty => "EMPTY",
            SessionOutcome::ClientError => "CLIENT_ERROR",
            SessionOutcome::Rejected(_) => "REJECTED",
            SessionOutcome::CacheHit { .. } => "HIT",
            SessionOutcome::Fetched { .. } => "FETCHED",
            SessionOutcome::FetchFailed(_) => "FETCH_FAILED",
            SessionOutcome::RelayFailed => "RELAY_FAILED",
        }
    }
}

/// Serve exactly one request on `stream`, then close it.
pub async fn handle_session<S>(stream: S, peer: SocketAddr, app: &AppContext) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let _inflight = InflightGuard::new();
    let mut session = Session {
        stream,
        peer,
        app,
        state: SessionState::AwaitingRequest,
        log: Some(AccessLogBuilder::new(peer)),
        start: Instant::now(),
        bytes_in: 0,
        bytes_out: 0,
    };
    let outcome = session.run().await;
    session.close(&outcome).await;
    outcome
}

struct Session<'a, S> {
    stream: S,
    peer: SocketAddr,
    app: &'a AppContext,
    state: SessionState,
    log: Option<AccessLogBuilder>,
    start: Instant,
    bytes_in: u64,
    bytes_out: u64,
}

impl<S> Session<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn run(&mut self) -> SessionOutcome {
        let raw = match self.read_request().await {
            Ok(raw) if raw.is_empty() => {
                debug!(peer = %self.peer, "client closed connection without a request");
                return SessionOutcome::Empty;
            }
            Ok(raw) => raw,
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "failed to read client request");
                self.annotate(|log| log.error_reason("client_read").error_detail(err.to_string()));
                return SessionOutcome::ClientError;
            }
        };

        let request = match parse_request(&raw) {
            Ok(request) => request,
            Err(err) => return self.reject(err).await,
        };
        self.transition(SessionState::Parsed);
        let method = request.method.as_str().to_string();
        let host = request.host.clone();
        let path = request.path.clone();
        self.annotate(|log| log.method(method).host(host).path(path));

        let key = CacheKey::for_request(&request);
        if let Some(cached) = self.lookup(&request, &key).await {
            self.transition(SessionState::CacheHit);
            return match self.relay_to_client(&cached).await {
                Some(bytes) => SessionOutcome::CacheHit { bytes },
                None => SessionOutcome::RelayFailed,
            };
        }
        self.transition(SessionState::CacheMiss);
        self.fetch_and_relay(&request, &key).await
    }

    async fn read_request(&mut self) -> Result<Vec<u8>> {
        let limit = self.app.settings.max_request_size;
        let deadline = Deadline::now() + self.app.settings.client_timeout();
        let mut raw = Vec::with_capacity(REQUEST_READ_CHUNK);
        let mut chunk = [0u8; REQUEST_READ_CHUNK];

        while raw.len() < limit && !has_header_terminator(&raw) {
            let want = chunk.len().min(limit - raw.len());
            let n = match timeout_at(deadline, self.stream.read(&mut chunk[..want])).await {
                Ok(result) => result?,
                // A complete request line is enough to proceed.
                Err(_) if raw.contains(&b'\n') => break,
                Err(_) => bail!("timed out reading request from {}", self.peer),
            };
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..n]);
        }

        if raw.len() >= limit && !has_header_terminator(&raw) {
            trace!(peer = %self.peer, limit, "client request truncated at buffer limit");
        }
        self.bytes_in = raw.len() as u64;
        Ok(raw)
    }

    async fn reject(&mut self, err: ParseError) -> SessionOutcome {
        warn!(
            peer = %self.peer,
            reason = err.reason(),
            error = %err,
            "rejecting client request"
        );
        let reason = err.reason();
        self.annotate(|log| log.error_reason(reason).error_detail(err.to_string()));
        let (status, body): (StatusCode, &[u8]) = match err {
            ParseError::UnsupportedMethod(_) => {
                (StatusCode::METHOD_NOT_ALLOWED, b"only GET is supported\r\n")
            }
            ParseError::UnsupportedScheme(_) => {
                (StatusCode::BAD_REQUEST, b"only http:// URLs are supported\r\n")
            }
            ParseError::RelativeUrlUnsupported(_) => {
                (StatusCode::BAD_REQUEST, b"absolute URL required\r\n")
            }
            ParseError::MalformedRequest(_) => (StatusCode::BAD_REQUEST, b"malformed request\r\n"),
        };
        self.send_error(status, body).await;
        SessionOutcome::Rejected(reason)
    }

    async fn lookup(&mut self, request: &ProxyRequest, key: &CacheKey) -> Option<Bytes> {
        let Some(cache) = self.app.cache.clone() else {
            return None;
        };
        if request.bypass_cache {
            debug!(peer = %self.peer, resource = key.resource(), "client requested cache bypass");
            metrics::record_cache_lookup("bypass");
            self.annotate(|log| log.cache_lookup("bypass"));
            return None;
        }

        match cache.lookup(key).await {
            Ok(Some(bytes)) => {
                debug!(resource = key.resource(), bytes = bytes.len(), "cache hit");
                metrics::record_cache_lookup("hit");
                self.annotate(|log| log.cache_lookup("hit"));
                Some(bytes)
            }
            Ok(None) => {
                debug!(resource = key.resource(), "cache miss");
                metrics::record_cache_lookup("miss");
                self.annotate(|log| log.cache_lookup("miss"));
                None
            }
            Err(err) => {
                warn!(
                    resource = key.resource(),
                    url = %request.target_url,
                    error = ?err,
                    "cache read failed; fetching from origin"
                );
                metrics::record_cache_lookup("error");
                self.annotate(|log| log.cache_lookup("error"));
                None
            }
        }
    }

    async fn fetch_and_relay(&mut self, request: &ProxyRequest, key: &CacheKey) -> SessionOutcome {
        self.transition(SessionState::Fetching);
        let port = request.port_or(self.app.settings.origin_port);
        let fetched = match self
            .app
            .fetcher
            .fetch(&request.host, port, &request.path)
            .await
        {
            Ok(fetched) => fetched,
            Err(err) => return self.fetch_failed(request, err).await,
        };

        let cached = self.store(request, key, &fetched.body, fetched.truncated).await;
        self.transition(SessionState::Relaying);
        match self.relay_to_client(&fetched.body).await {
            Some(bytes) => SessionOutcome::Fetched { bytes, cached },
            None => SessionOutcome::RelayFailed,
        }
    }

    async fn fetch_failed(&mut self, request: &ProxyRequest, err: FetchError) -> SessionOutcome {
        warn!(
            peer = %self.peer,
            url = %request.target_url,
            host = %request.host,
            kind = err.kind(),
            error = ?err,
            "origin fetch failed"
        );
        let kind = err.kind();
        self.annotate(|log| log.error_reason(kind).error_detail(err.to_string()));
        let status = match err {
            FetchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        self.send_error(status, b"").await;
        SessionOutcome::FetchFailed(kind)
    }

    /// Returns whether the response is now cached.
    async fn store(
        &mut self,
        request: &ProxyRequest,
        key: &CacheKey,
        body: &Bytes,
        truncated: bool,
    ) -> bool {
        let Some(cache) = self.app.cache.clone() else {
            return false;
        };
        if truncated {
            warn!(
                url = %request.target_url,
                limit = self.app.settings.max_response_size,
                "origin response exceeded size limit; relaying truncated response without caching"
            );
            self.annotate(|log| log.cache_store("skipped"));
            return false;
        }

        match cache.store(key, body.clone()).await {
            Ok(()) => {
                debug!(resource = key.resource(), bytes = body.len(), "cached origin response");
                metrics::record_cache_store();
                self.annotate(|log| log.cache_store("stored"));
                true
            }
            Err(err) => {
                log_store_error(request, &err);
                metrics::record_cache_store_error();
                self.annotate(|log| log.cache_store("error"));
                false
            }
        }
    }

    async fn relay_to_client(&mut self, bytes: &Bytes) -> Option<u64> {
        self.transition(SessionState::Relaying);
        let write_timeout = self.app.settings.client_timeout();
        match relay(&mut self.stream, bytes, write_timeout).await {
            Ok(written) => {
                self.bytes_out += written as u64;
                Some(written as u64)
            }
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "client went away during relay");
                self.annotate(|log| log.error_reason("client_write").error_detail(err.to_string()));
                None
            }
        }
    }

    async fn send_error(&mut self, status: StatusCode, body: &[u8]) {
        if !self.app.settings.error_responses {
            return;
        }
        let write_timeout = self.app.settings.client_timeout();
        match send_status(&mut self.stream, status, body, write_timeout).await {
            Ok(written) => {
                self.bytes_out += written as u64;
                self.annotate(|log| log.status(status));
            }
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "failed to send error response");
            }
        }
    }

    async fn close(&mut self, outcome: &SessionOutcome) {
        self.transition(SessionState::Closed);
        let close_timeout = self.app.settings.client_timeout();
        if let Err(err) = shutdown_stream(&mut self.stream, close_timeout).await {
            trace!(peer = %self.peer, error = %err, "client stream shutdown failed");
        }
        if let Some(log) = self.log.take() {
            log.outcome(outcome.label())
                .bytes_in(self.bytes_in)
                .bytes_out(self.bytes_out)
                .elapsed(self.start.elapsed())
                .log();
        }
    }

    fn transition(&mut self, next: SessionState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    fn annotate(&mut self, f: impl FnOnce(AccessLogBuilder) -> AccessLogBuilder) {
        if let Some(log) = self.log.take() {
            self.log = Some(f(log));
        }
    }
}

fn log_store_error(request: &ProxyRequest, err: &CacheError) {
    warn!(
        url = %request.target_url,
        host = %request.host,
        error = ?err,
        "failed to store response in cache; relaying uncached"
    );
}

fn has_header_terminator(raw: &[u8]) -> bool {
    raw.windows(4).any(|w| w == b"\r\n\r\n") || raw.windows(2).any(|w| w == b"\n\n")
}

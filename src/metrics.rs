use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, ensure};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::io_util::{with_deadline, write_all_with_timeout};

const METRICS_IO_TIMEOUT: Duration = Duration::from_secs(5);
const METRICS_MAX_REQUEST_BYTES: usize = 8 * 1024;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static SESSIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("sessions_total", "Client sessions by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register sessions_total");
    vec
});

static SESSION_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("session_duration_seconds", "Client session latency")
        .buckets(latency_buckets());
    let histogram = Histogram::with_opts(opts).expect("create histogram");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("register session_duration_seconds");
    histogram
});

static ORIGIN_FETCH_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new(
        "origin_fetch_duration_seconds",
        "Time spent fetching responses from origin servers",
    )
    .buckets(latency_buckets());
    let histogram = Histogram::with_opts(opts).expect("create histogram");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("register origin_fetch_duration_seconds");
    histogram
});

static ORIGIN_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("origin_errors_total", "Origin fetch failures by kind");
    let vec = IntCounterVec::new(opts, &["kind"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register origin_errors_total");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_store_total", "Cache store calls").expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_errors_total", "Cache store errors")
        .expect("create cache_store_errors_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_errors_total");
    counter
});

static INFLIGHT_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge =
        IntGauge::new("inflight_sessions", "Client sessions in progress").expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register inflight_sessions");
    gauge
});

fn latency_buckets() -> Vec<f64> {
    vec![
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ]
}

fn normalize_label(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_ascii_lowercase()
    }
}

/// Decrements the in-flight gauge when dropped so every session exit path is counted.
pub struct InflightGuard(());

impl InflightGuard {
    pub fn new() -> Self {
        INFLIGHT_SESSIONS.inc();
        Self(())
    }
}

impl Default for InflightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        INFLIGHT_SESSIONS.dec();
    }
}

pub fn record_session(outcome: &str, elapsed: Duration) {
    let outcome = normalize_label(outcome, "unknown");
    SESSIONS_TOTAL.with_label_values(&[outcome.as_str()]).inc();
    SESSION_DURATION_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_origin_fetch(elapsed: Duration) {
    ORIGIN_FETCH_DURATION_SECONDS.observe(elapsed.as_secs_f64());
}

pub fn record_origin_error(kind: &str) {
    ORIGIN_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_cache_lookup(result: &str) {
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    buffer
}

/// Serve the registry in Prometheus text format on `addr` at `path`.
pub async fn serve(addr: SocketAddr, path: String) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    let path: Arc<str> = if path.is_empty() {
        Arc::from("/metrics")
    } else {
        Arc::from(path)
    };
    loop {
        let (stream, peer) = listener.accept().await?;
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(stream, &path).await {
                tracing::debug!(peer = %peer, error = %err, "metrics request failed");
            }
        });
    }
}

async fn handle_stream<S>(mut stream: S, path: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_head(&mut stream).await?;
    let text = String::from_utf8_lossy(&head);
    let mut parts = text.lines().next().unwrap_or_default().split_whitespace();

    let response = match (parts.next(), parts.next()) {
        (Some("GET"), Some(uri)) if uri == path => {
            build_response(200, TextEncoder::new().format_type(), gather())
        }
        (None, _) => return Ok(()),
        _ => build_response(404, "text/plain", b"not found".to_vec()),
    };

    write_all_with_timeout(&mut stream, &response, METRICS_IO_TIMEOUT, "writing metrics").await?;
    with_deadline(METRICS_IO_TIMEOUT, stream.shutdown(), "closing metrics stream").await
}

async fn read_head<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = with_deadline(METRICS_IO_TIMEOUT, stream.read(&mut chunk), "reading metrics request")
            .await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        ensure!(
            head.len() <= METRICS_MAX_REQUEST_BYTES,
            "metrics request exceeds {METRICS_MAX_REQUEST_BYTES} bytes"
        );
    }
    Ok(head)
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(&body);
    response
}

#![allow(dead_code)]

pub mod logging;
pub mod net;
pub mod upstream;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use cacheproxy::{
    cli::LogFormat,
    proxy::{self, AppContext, cache::SharedCache},
    settings::{CacheMode, Settings},
};

pub use net::{find_free_port, wait_for_listener};
pub use upstream::TestOrigin;

pub fn default_test_settings(listen: SocketAddr, cache_dir: &Path, origin_port: u16) -> Settings {
    Settings {
        listen,
        log: LogFormat::Text,
        cache_mode: CacheMode::Disk,
        cache_dir: cache_dir.to_path_buf(),
        cache_enabled: true,
        client_timeout: 2,
        upstream_connect_timeout: 2,
        upstream_read_timeout: 2,
        origin_port,
        ..Settings::default()
    }
}

pub struct ProxyHarness {
    _temp: TempDir,
    pub cache_dir: PathBuf,
    pub addr: SocketAddr,
    pub settings: Arc<Settings>,
    pub cache: Option<SharedCache>,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    pub async fn connect(&self) -> Result<TcpStream> {
        Ok(TcpStream::connect(self.addr).await?)
    }

    /// Send one raw request and read until the proxy closes the connection.
    pub async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.connect().await?;
        stream.write_all(request).await?;
        read_to_close(&mut stream).await
    }

    pub async fn get(&self, url: &str) -> Result<Vec<u8>> {
        self.exchange(format!("GET {url} HTTP/1.1\r\nConnection: close\r\n\r\n").as_bytes())
            .await
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

pub struct ProxyHarnessBuilder {
    origin_port: u16,
    settings_override: Option<Box<dyn FnOnce(&mut Settings) + Send>>,
}

impl ProxyHarnessBuilder {
    pub fn new(origin_port: u16) -> Self {
        Self {
            origin_port,
            settings_override: None,
        }
    }

    pub fn with_settings<F>(mut self, func: F) -> Self
    where
        F: FnOnce(&mut Settings) + Send + 'static,
    {
        self.settings_override = Some(Box::new(func));
        self
    }

    pub async fn spawn(mut self) -> Result<ProxyHarness> {
        let temp = TempDir::new()?;
        let cache_dir = temp.path().join("cache");

        let proxy_port = find_free_port()?;
        let proxy_addr: SocketAddr = format!("127.0.0.1:{proxy_port}")
            .parse()
            .context("valid listen address")?;

        let mut settings = default_test_settings(proxy_addr, &cache_dir, self.origin_port);
        if let Some(override_fn) = self.settings_override.take() {
            override_fn(&mut settings);
        }
        settings.validate()?;
        let proxy_addr = settings.listen;
        let cache_dir = settings.cache_dir.clone();
        let settings = Arc::new(settings);

        let cache = proxy::cache::build_cache_store(&settings).await?;
        let app = AppContext::new(settings.clone(), cache.clone());

        let handle = tokio::spawn(async move {
            if let Err(err) = proxy::run(app).await {
                tracing::error!(error = ?err, "proxy run failed");
            }
        });

        wait_for_listener(proxy_addr).await?;

        Ok(ProxyHarness {
            _temp: temp,
            cache_dir,
            addr: proxy_addr,
            settings,
            cache,
            handle,
        })
    }
}

pub async fn read_to_close(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    timeout(StdDuration::from_secs(10), stream.read_to_end(&mut buf))
        .await
        .map_err(|_| anyhow!("proxy did not close the connection"))??;
    Ok(buf)
}

pub fn status_code(response: &[u8]) -> Option<u16> {
    let line_end = response.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&response[..line_end]).ok()?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Count regular files below `dir`, ignoring in-flight temp files.
pub fn cached_file_count(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                cached_file_count(&path)
            } else if entry.file_name().to_string_lossy().starts_with("tmp_") {
                0
            } else {
                1
            }
        })
        .sum()
}

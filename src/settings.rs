use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

/// Smallest request buffer accepted; a request line must fit in it.
pub const MIN_REQUEST_SIZE: usize = 4096;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8888))
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_cache_enabled() -> bool {
    true
}

fn default_client_timeout() -> u64 {
    10
}

fn default_upstream_connect_timeout() -> u64 {
    10
}

fn default_upstream_read_timeout() -> u64 {
    10
}

fn default_origin_port() -> u16 {
    80
}

fn default_max_request_size() -> usize {
    8 * 1024
}

fn default_max_response_size() -> usize {
    64 * 1024 * 1024
}

fn default_error_responses() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    #[default]
    Disk,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub cache_mode: CacheMode,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_read_timeout")]
    pub upstream_read_timeout: u64,
    #[serde(default = "default_origin_port")]
    pub origin_port: u16,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    #[serde(default = "default_max_response_size")]
    pub max_response_size: usize,
    #[serde(default = "default_error_responses")]
    pub error_responses: bool,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log: default_log_format(),
            cache_mode: CacheMode::default(),
            cache_dir: default_cache_dir(),
            cache_enabled: default_cache_enabled(),
            client_timeout: default_client_timeout(),
            upstream_connect_timeout: default_upstream_connect_timeout(),
            upstream_read_timeout: default_upstream_read_timeout(),
            origin_port: default_origin_port(),
            max_request_size: default_max_request_size(),
            max_response_size: default_max_response_size(),
            error_responses: default_error_responses(),
            metrics_listen: None,
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        if let Some(path) = &config_path {
            builder = builder.add_source(File::from(path.clone()).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("CACHEPROXY")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        if let Some(path) = &config_path {
            settings.apply_base_dir(path);
        }
        settings.apply_cli(cli);
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_read_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_read_timeout)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen {
            self.listen = listen;
        }
        if let Some(cache_dir) = &cli.cache_dir {
            self.cache_dir = cache_dir.clone();
        }
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        self.cache_dir = absolutize(&self.cache_dir, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_read_timeout > 0,
            "upstream_read_timeout must be greater than 0 seconds (got {})",
            self.upstream_read_timeout
        );
        ensure!(self.origin_port > 0, "origin_port must not be 0");
        ensure!(
            self.max_request_size >= MIN_REQUEST_SIZE,
            "max_request_size must be at least {MIN_REQUEST_SIZE} bytes (got {})",
            self.max_request_size
        );
        ensure!(
            self.max_response_size > 0,
            "max_response_size must be greater than 0 (got {})",
            self.max_response_size
        );
        if self.cache_enabled && self.cache_mode == CacheMode::Disk {
            ensure!(
                !self.cache_dir.as_os_str().is_empty(),
                "cache_dir must be set when cache_mode is disk"
            );
        }
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<Option<PathBuf>> {
    if let Some(path) = &cli.config {
        if !path.exists() {
            bail!("configuration file {} does not exist", path.display());
        }
        return Ok(Some(path.clone()));
    }

    Ok(default_config_candidates()
        .into_iter()
        .find(|candidate| candidate.exists()))
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/cacheproxy/cacheproxy.toml"),
        PathBuf::from("cacheproxy.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

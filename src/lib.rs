pub mod cli;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::{CacheMode, Settings};

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        let path = "/metrics".to_string();
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, path).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let cache = proxy::cache::build_cache_store(&settings).await?;
    match (&cache, settings.cache_mode) {
        (None, _) => tracing::info!("response cache disabled"),
        (Some(_), CacheMode::Disk) => {
            tracing::info!(dir = %settings.cache_dir.display(), "using disk response cache")
        }
        (Some(_), CacheMode::Memory) => tracing::info!("using in-memory response cache"),
    }

    let app = proxy::AppContext::new(settings, cache);
    proxy::run(app).await
}

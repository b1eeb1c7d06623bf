pub mod cache;
pub mod listener;
pub mod origin;
pub mod request;
pub mod respond;
pub mod session;

use anyhow::Result;
use std::sync::Arc;

use crate::settings::Settings;

use self::cache::SharedCache;
use self::origin::OriginFetcher;

/// State shared by every client session.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Option<SharedCache>,
    pub fetcher: OriginFetcher,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, cache: Option<SharedCache>) -> Self {
        let fetcher = OriginFetcher::from_settings(&settings);
        Self {
            settings,
            cache,
            fetcher,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}

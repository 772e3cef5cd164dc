//! HTTP script fetcher backed by the on-disk script cache.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use super::{LoadError, ScriptFetcher};
use crate::{cache::ScriptCache, config::Config};

pub struct HttpScriptFetcher {
    client: Client,
    cache: Option<ScriptCache>,
}

impl HttpScriptFetcher {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(cfg.request_timeout()).build()?;
        Ok(Self::new(client, Some(ScriptCache::from_config(cfg))))
    }

    pub fn new(client: Client, cache: Option<ScriptCache>) -> Self {
        Self { client, cache }
    }
}

#[async_trait]
impl ScriptFetcher for HttpScriptFetcher {
    async fn fetch(&self, url: &str) -> Result<String, LoadError> {
        if let Some(text) = self.cache.as_ref().and_then(|c| c.get(url)) {
            debug!(target: "hibiki", url, "script served from cache");
            return Ok(text);
        }

        let fail = |message: String| LoadError::Fetch { url: url.to_string(), message };
        let resp = self.client.get(url).send().await.map_err(|e| fail(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(fail(status.to_string()));
        }
        let text = resp.text().await.map_err(|e| fail(e.to_string()))?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(url, &text) {
                warn!(target: "hibiki", url, error = %e, "could not cache script");
            }
        }
        Ok(text)
    }
}

//! Public key retrieval over HTTP.

use crate::downloader::retry_request;
use async_trait::async_trait;
use tokio::sync::RwLock;
use updraft_signer::{KeySource, PublicKey, SignerError, SignerResult};
use url::Url;

/// Fetches the manifest signing key from a URL and caches it in memory.
pub struct HttpKeySource {
    http: reqwest::Client,
    url: Url,
    cached: RwLock<Option<PublicKey>>,
}

impl HttpKeySource {
    pub fn new(http: reqwest::Client, url: Url) -> Self {
        Self {
            http,
            url,
            cached: RwLock::new(None),
        }
    }

    async fn fetch(&self) -> SignerResult<PublicKey> {
        let response = retry_request(|| self.http.get(self.url.clone()).send())
            .await
            .map_err(|e| SignerError::KeyFetch(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SignerError::KeyFetch(format!(
                "{} returned {status}",
                self.url
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| SignerError::KeyFetch(e.to_string()))?;
        PublicKey::from_base64(&body)
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn public_key(&self, bypass_cache: bool) -> SignerResult<PublicKey> {
        if !bypass_cache && let Some(key) = self.cached.read().await.clone() {
            return Ok(key);
        }

        let key = self.fetch().await?;
        tracing::debug!(url = %self.url, "Fetched manifest signing key");
        *self.cached.write().await = Some(key.clone());
        Ok(key)
    }
}

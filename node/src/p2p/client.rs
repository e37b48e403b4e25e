use crate::p2p::messages::{HeadInfo, HeaderSummary};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use cancelchain_config::PeerConfig;
use cancelchain_core::{Block, Transaction, Utxo};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Attempts per peer request before the peer is skipped for the round.
pub const PEER_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 250;

/// Read side of the peer API, as used by chain sync.
#[async_trait]
pub trait PeerClient: Send + Sync {
    fn url(&self) -> &str;
    async fn head(&self) -> Result<HeadInfo>;
    async fn headers(&self, from_height: u64, count: u64) -> Result<Vec<HeaderSummary>>;
    async fn blocks(&self, from_height: u64, count: u64) -> Result<Vec<Block>>;
}

pub struct HttpPeer {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpPeer {
    pub fn new(config: &PeerConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building peer http client")?;
        Ok(HttpPeer {
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            client,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn with_retries<T, F, Fut>(&self, what: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err = anyhow!("no attempt made");
        for n in 1..=PEER_RETRIES {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    log::debug!(
                        "Peer {} {} failed (attempt {}/{}): {:#}",
                        self.url,
                        what,
                        n,
                        PEER_RETRIES,
                        err
                    );
                    last_err = err;
                }
            }
            if n < PEER_RETRIES {
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * n as u64)).await;
            }
        }
        Err(last_err.context(format!("peer {} {} failed", self.url, what)))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.url, path);
        let url = url.as_str();
        self.with_retries(path, || async move {
            let response = self
                .authorize(self.client.get(url))
                .send()
                .await?
                .error_for_status()?;
            Ok(response.json::<T>().await?)
        })
        .await
    }

    async fn post_json<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        let url = format!("{}{}", self.url, path);
        let url = url.as_str();
        self.with_retries(path, || async move {
            self.authorize(self.client.post(url))
                .json(body)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }

    pub async fn post_block(&self, block: &Block) -> Result<()> {
        self.post_json("/block", block).await
    }

    pub async fn post_transaction(&self, tx: &Transaction) -> Result<()> {
        self.post_json("/transaction", tx).await
    }

    /// Unspent outputs the peer holds for `address`.
    pub async fn utxos(&self, address: &str) -> Result<Vec<Utxo>> {
        self.get_json(&format!("/address/{}/utxos", address)).await
    }
}

#[async_trait]
impl PeerClient for HttpPeer {
    fn url(&self) -> &str {
        &self.url
    }

    async fn head(&self) -> Result<HeadInfo> {
        self.get_json("/head").await
    }

    async fn headers(&self, from_height: u64, count: u64) -> Result<Vec<HeaderSummary>> {
        self.get_json(&format!("/headers?from_height={}&count={}", from_height, count))
            .await
    }

    async fn blocks(&self, from_height: u64, count: u64) -> Result<Vec<Block>> {
        self.get_json(&format!("/blocks?from_height={}&count={}", from_height, count))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_trimmed() {
        let peer = HttpPeer::new(
            &PeerConfig {
                url: "http://10.0.0.7:8080/".into(),
                token: None,
            },
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(peer.url(), "http://10.0.0.7:8080");
    }

    #[tokio::test]
    async fn unreachable_peer_fails_after_retries() {
        let peer = HttpPeer::new(
            &PeerConfig {
                url: "http://127.0.0.1:9".into(),
                token: Some("t".into()),
            },
            Duration::from_millis(200),
        )
        .unwrap();
        let err = peer.head().await.unwrap_err();
        assert!(format!("{:#}", err).contains("/head"));
    }
}

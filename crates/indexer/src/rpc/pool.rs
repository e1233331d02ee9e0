//! Rotating WebSocket provider pool.

use alloy::providers::{Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy::pubsub::{PubSubFrontend, Subscription};
use alloy::rpc::types::{Filter, Header, Log};
use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::debug;

struct Inner {
    provider: Option<RootProvider<PubSubFrontend>>,
    uses: u32,
}

/// Hands out WebSocket providers, reconnecting after a fixed number of
/// subscriptions so long-lived connections do not accumulate server-side
/// subscription state.
pub struct WsPool {
    ws_url: String,
    rotate_limit: u32,
    inner: Mutex<Inner>,
}

impl WsPool {
    /// Create a pool over one WebSocket endpoint.
    pub fn new(ws_url: impl Into<String>, rotate_limit: u32) -> Self {
        Self {
            ws_url: ws_url.into(),
            rotate_limit: rotate_limit.max(1),
            inner: Mutex::new(Inner {
                provider: None,
                uses: 0,
            }),
        }
    }

    /// Get a provider, rotating the underlying connection when due.
    pub async fn provider(&self) -> Result<RootProvider<PubSubFrontend>> {
        let mut inner = self.inner.lock().await;

        if inner.provider.is_none() || inner.uses >= self.rotate_limit {
            debug!(url = %self.ws_url, "Opening WebSocket connection");
            let ws = WsConnect::new(&self.ws_url);
            let provider = ProviderBuilder::new()
                .on_ws(ws)
                .await
                .with_context(|| format!("Failed to connect WebSocket: {}", self.ws_url))?;
            inner.provider = Some(provider);
            inner.uses = 0;
        }

        inner.uses += 1;
        inner
            .provider
            .clone()
            .context("WebSocket provider missing after connect")
    }

    /// Subscribe to new block headers.
    pub async fn subscribe_blocks(&self) -> Result<Subscription<Header>> {
        let provider = self.provider().await?;
        provider
            .subscribe_blocks()
            .await
            .context("Failed to subscribe to block headers")
    }

    /// Subscribe to logs matching a filter.
    pub async fn subscribe_logs(&self, filter: &Filter) -> Result<Subscription<Log>> {
        let provider = self.provider().await?;
        provider
            .subscribe_logs(filter)
            .await
            .context("Failed to subscribe to logs")
    }
}

//! Token indexer pipeline.
//!
//! Moves items through the metadata state machine:
//!
//! ```text
//! new → has_token_uri → has_image_url → has_hosted_image
//!     → parsing_attributes → fetching_animation → done
//! ```
//!
//! Each stage does one piece of external work. On success the item
//! advances and its retry counter resets; on failure the counter bumps
//! and the state stays put, until the cap parks the item as `invalid`.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use nfttrack_core::{Attribute, IndexerState, TokenType};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::rpc::{call_request, ThrottledClient};
use crate::storage::{ItemRecord, Storage};

pub mod media;
pub mod metadata;

pub use media::{AssetKind, MediaStore};
pub use metadata::ParserRegistry;

sol! {
    interface IErc721Metadata {
        function tokenURI(uint256 tokenId) external view returns (string);
    }
    interface IErc1155Metadata {
        function uri(uint256 id) external view returns (string);
    }
}

/// Resolves a token's metadata URI on chain. Trait seam so the pipeline
/// is testable without a node.
#[async_trait]
pub trait TokenUriSource: Send + Sync {
    /// `tokenURI(tokenId)` or `uri(id)` depending on the token standard.
    async fn token_uri(
        &self,
        contract: Address,
        token_id: U256,
        token_type: TokenType,
    ) -> Result<String>;
}

/// Production [`TokenUriSource`] over the throttled client.
pub struct RpcTokenUriSource {
    client: ThrottledClient,
}

impl RpcTokenUriSource {
    /// Wrap a throttled client.
    pub fn new(client: ThrottledClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TokenUriSource for RpcTokenUriSource {
    async fn token_uri(
        &self,
        contract: Address,
        token_id: U256,
        token_type: TokenType,
    ) -> Result<String> {
        let uri = match token_type {
            TokenType::Erc1155 => {
                let input: Bytes = IErc1155Metadata::uriCall { id: token_id }.abi_encode().into();
                let returned = self.client.call(&call_request(contract, input)).await?;
                let decoded = IErc1155Metadata::uriCall::abi_decode_returns(&returned, true)
                    .context("Malformed uri() return data")?;
                // EIP-1155 substitution: {id} expands to the token id as
                // 64 lower-case hex digits.
                decoded
                    ._0
                    .replace("{id}", &format!("{:064x}", token_id))
            }
            _ => {
                let input: Bytes = IErc721Metadata::tokenURICall { tokenId: token_id }
                    .abi_encode()
                    .into();
                let returned = self.client.call(&call_request(contract, input)).await?;
                IErc721Metadata::tokenURICall::abi_decode_returns(&returned, true)
                    .context("Malformed tokenURI() return data")?
                    ._0
            }
        };
        Ok(uri)
    }
}

/// Fetches bytes for a metadata or asset URI.
///
/// Returns the payload and its content type.
#[async_trait]
pub trait UriFetcher: Send + Sync {
    /// Download `uri` and return `(payload, content_type)`.
    async fn fetch(&self, uri: &str) -> Result<(Vec<u8>, String)>;
}

/// HTTP fetcher with IPFS gateway fallback, `ar://` rewriting and
/// inline `data:` URIs.
pub struct HttpFetcher {
    client: reqwest::Client,
    ipfs_gateways: Vec<String>,
    max_bytes: usize,
}

impl HttpFetcher {
    /// Build the client from the pipeline's timeout, gateways and byte cap.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            ipfs_gateways: config.ipfs_gateways.clone(),
            max_bytes: config.max_fetch_bytes,
        })
    }

    /// Candidate URLs for a URI, in the order they should be tried.
    fn resolve(&self, uri: &str) -> Vec<String> {
        if let Some(path) = uri.strip_prefix("ipfs://") {
            let path = path.strip_prefix("ipfs/").unwrap_or(path);
            return self
                .ipfs_gateways
                .iter()
                .map(|gateway| format!("{gateway}{path}"))
                .collect();
        }
        if let Some(path) = uri.strip_prefix("ar://") {
            return vec![format!("https://arweave.net/{path}")];
        }
        vec![uri.to_string()]
    }

    async fn fetch_one(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("Request to {url} failed"))?;

        if let Some(length) = response.content_length() {
            if length as usize > self.max_bytes {
                bail!("{url} is {length} bytes, over the {} byte cap", self.max_bytes);
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let bytes = response.bytes().await.context("Failed to read body")?;
        if bytes.len() > self.max_bytes {
            bail!("{url} body is over the {} byte cap", self.max_bytes);
        }
        Ok((bytes.to_vec(), content_type))
    }
}

#[async_trait]
impl UriFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<(Vec<u8>, String)> {
        if let Some(rest) = uri.strip_prefix("data:") {
            return decode_data_uri(rest);
        }

        let mut last_err = anyhow!("no candidate URL for {uri}");
        for url in self.resolve(uri) {
            match self.fetch_one(&url).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    debug!("fetch of {url} failed: {err:#}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

/// Decode the payload of a `data:` URI (the part after the scheme).
fn decode_data_uri(rest: &str) -> Result<(Vec<u8>, String)> {
    let (meta, payload) = rest
        .split_once(',')
        .context("data: URI without a comma separator")?;
    let (media_type, is_base64) = match meta.strip_suffix(";base64") {
        Some(media_type) => (media_type, true),
        None => (meta, false),
    };
    let media_type = if media_type.is_empty() {
        "text/plain"
    } else {
        media_type
    };

    let bytes = if is_base64 {
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .context("Invalid base64 in data: URI")?
    } else {
        payload.as_bytes().to_vec()
    };
    Ok((bytes, media_type.to_string()))
}

/// Timer-driven worker pool advancing items through the pipeline.
pub struct TokenIndexer {
    storage: Storage,
    uri_source: Arc<dyn TokenUriSource>,
    fetcher: Arc<dyn UriFetcher>,
    parsers: Arc<ParserRegistry>,
    media: MediaStore,
    config: PipelineConfig,
}

impl TokenIndexer {
    /// Assemble the pipeline around its storage and fetch seams.
    pub fn new(
        storage: Storage,
        uri_source: Arc<dyn TokenUriSource>,
        fetcher: Arc<dyn UriFetcher>,
        parsers: Arc<ParserRegistry>,
        media: MediaStore,
        config: PipelineConfig,
    ) -> Self {
        Self {
            storage,
            uri_source,
            fetcher,
            parsers,
            media,
            config,
        }
    }

    /// Run until cancelled. Scan failures are logged and retried on the
    /// next tick; per-item failures are charged to the item.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            batch = self.config.batch,
            workers = self.config.workers,
            "Token indexer starting"
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Token indexer stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.scan().await {
                        warn!("Indexer scan failed: {err:#}");
                    }
                }
            }
        }
    }

    /// One polling pass: pick up a batch and advance items concurrently.
    pub async fn scan(&self) -> Result<()> {
        let items = self
            .storage
            .fetch_pending_items(self.config.retry_limit, self.config.batch)
            .await?;
        if items.is_empty() {
            return Ok(());
        }

        futures_util::stream::iter(items)
            .for_each_concurrent(self.config.workers as usize, |item| async move {
                let key = (item.chain_id, item.contract, item.token_id);
                if let Err(err) = self.advance(item).await {
                    warn!(
                        contract = %key.1,
                        token_id = %key.2,
                        "Indexing step failed: {err:#}"
                    );
                    if let Err(err) = self
                        .storage
                        .record_indexer_failure(
                            key.0,
                            &key.1,
                            &key.2,
                            self.config.retry_limit,
                            chrono::Utc::now().timestamp(),
                        )
                        .await
                    {
                        warn!("Failed to record indexing failure: {err:#}");
                    }
                }
            })
            .await;
        Ok(())
    }

    /// Run the stage the item's state calls for and persist the result.
    pub async fn advance(&self, mut item: ItemRecord) -> Result<()> {
        match item.indexer_state {
            IndexerState::New | IndexerState::NewRefreshing => {
                let uri = self
                    .uri_source
                    .token_uri(item.contract, item.token_id, item.token_type)
                    .await?;
                if uri.is_empty() {
                    bail!("empty token URI");
                }
                item.token_uri = uri;
            }
            IndexerState::HasTokenUri | IndexerState::HasTokenUriRefreshing => {
                let raw = self.fetch_metadata(&item).await?;
                item.image_url =
                    metadata::extract_image(&raw).context("metadata has no image field")?;
            }
            IndexerState::HasImageUrl => {
                let (bytes, content_type) = self.fetcher.fetch(&item.image_url).await?;
                item.hosted_image_url = self
                    .media
                    .store(
                        item.chain_id,
                        &item.contract,
                        &item.token_id,
                        AssetKind::Image,
                        &content_type,
                        &bytes,
                    )
                    .await?;
                item.mime_type = content_type;
            }
            IndexerState::HasHostedImage => {
                let raw = self.fetch_metadata(&item).await?;
                item.attributes = self.parse_attributes(&item, &raw).await?;
            }
            IndexerState::ParsingAttributes => {
                let raw = self.fetch_metadata(&item).await?;
                if let Some(animation_url) = metadata::extract_animation(&raw) {
                    let (bytes, content_type) = self.fetcher.fetch(&animation_url).await?;
                    item.hosted_animation_url = self
                        .media
                        .store(
                            item.chain_id,
                            &item.contract,
                            &item.token_id,
                            AssetKind::Animation,
                            &content_type,
                            &bytes,
                        )
                        .await?;
                    item.content_type = content_type;
                    item.animation_url = animation_url;
                }
            }
            // Nothing left to fetch; the hop to done is bookkeeping.
            IndexerState::FetchingAnimation => {}
            IndexerState::Done | IndexerState::Invalid => return Ok(()),
        }

        item.indexer_state = item.indexer_state.next();
        item.indexer_retry_count = 0;
        self.storage
            .save_item_indexing(&item, chrono::Utc::now().timestamp())
            .await
    }

    async fn fetch_metadata(&self, item: &ItemRecord) -> Result<Value> {
        let (bytes, _) = self.fetcher.fetch(&item.token_uri).await?;
        serde_json::from_slice(&bytes).context("Metadata is not valid JSON")
    }

    async fn parse_attributes(&self, item: &ItemRecord, raw: &Value) -> Result<Vec<Attribute>> {
        let mut attributes = self.parsers.parse(item.chain_id, &item.contract, raw);
        // Staking is chain state, not metadata; surfaced as a derived
        // trait for the collections that have positions at all.
        if self
            .storage
            .is_token_staked(item.chain_id, &item.contract, &item.token_id)
            .await?
        {
            attributes.push(Attribute::new("Staked", "Yes"));
        }
        Ok(attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::storage::test_storage;
    use alloy::primitives::address;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const CONTRACT: Address = address!("bc4ca0eda7647a8ab7c2061c2e118a18a936f13d");

    struct ScriptedUriSource {
        uris: HashMap<U256, String>,
    }

    #[async_trait]
    impl TokenUriSource for ScriptedUriSource {
        async fn token_uri(
            &self,
            _contract: Address,
            token_id: U256,
            _token_type: TokenType,
        ) -> Result<String> {
            self.uris
                .get(&token_id)
                .cloned()
                .context("no such token")
        }
    }

    /// Map-backed fetcher; every miss is an error, and fetches are
    /// recorded so tests can assert which URIs were touched.
    #[derive(Default)]
    struct MapFetcher {
        responses: HashMap<String, (Vec<u8>, String)>,
        fetched: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UriFetcher for MapFetcher {
        async fn fetch(&self, uri: &str) -> Result<(Vec<u8>, String)> {
            self.fetched.lock().unwrap().push(uri.to_string());
            self.responses.get(uri).cloned().context("unreachable URI")
        }
    }

    fn indexer(
        storage: Storage,
        uris: HashMap<U256, String>,
        fetcher: MapFetcher,
        media_root: &std::path::Path,
    ) -> TokenIndexer {
        let config = PipelineConfig {
            retry_limit: 2,
            batch: 20,
            workers: 4,
            ..PipelineConfig::default()
        };
        TokenIndexer::new(
            storage,
            Arc::new(ScriptedUriSource { uris }),
            Arc::new(fetcher),
            Arc::new(ParserRegistry::new()),
            MediaStore::new(&MediaConfig {
                root: media_root.to_string_lossy().into_owned(),
                base_url: "https://assets.example".to_string(),
            }),
            config,
        )
    }

    async fn seed_item(storage: &Storage, token: U256) {
        storage
            .ensure_item(1, &CONTRACT, &token, TokenType::Erc721, 100)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_item_walks_to_done() {
        let (storage, _temp_db) = test_storage().await;
        let media_dir = tempfile::tempdir().unwrap();
        let token = U256::from(1u64);
        seed_item(&storage, token).await;

        let metadata = serde_json::json!({
            "name": "Ape #1",
            "image": "ipfs://QmImage",
            "attributes": [{"trait_type": "Fur", "value": "Robot"}]
        });
        let mut fetcher = MapFetcher::default();
        fetcher.responses.insert(
            "https://meta.example/1".to_string(),
            (metadata.to_string().into_bytes(), "application/json".into()),
        );
        fetcher.responses.insert(
            "ipfs://QmImage".to_string(),
            (b"png-bytes".to_vec(), "image/png".into()),
        );

        let indexer = indexer(
            storage.clone(),
            HashMap::from([(token, "https://meta.example/1".to_string())]),
            fetcher,
            media_dir.path(),
        );

        // One scan per stage; six stages to done.
        for _ in 0..6 {
            indexer.scan().await.unwrap();
        }

        let item = storage.get_item(1, &CONTRACT, &token).await.unwrap().unwrap();
        assert_eq!(item.indexer_state, IndexerState::Done);
        assert_eq!(item.token_uri, "https://meta.example/1");
        assert_eq!(item.image_url, "ipfs://QmImage");
        assert!(item.hosted_image_url.ends_with("/1.image.png"));
        assert_eq!(item.mime_type, "image/png");
        assert_eq!(item.attributes, vec![Attribute::new("Fur", "Robot")]);
        assert_eq!(item.indexer_retry_count, 0);
        // No animation on this token.
        assert!(item.hosted_animation_url.is_empty());
    }

    #[tokio::test]
    async fn test_retry_cap_parks_item_and_refresh_revives_it() {
        let (storage, _temp_db) = test_storage().await;
        let media_dir = tempfile::tempdir().unwrap();
        let token = U256::from(7u64);
        seed_item(&storage, token).await;

        // tokenURI resolves but the metadata URI is unreachable.
        let indexer = indexer(
            storage.clone(),
            HashMap::from([(token, "https://dead.example/7".to_string())]),
            MapFetcher::default(),
            media_dir.path(),
        );

        indexer.scan().await.unwrap(); // new -> has_token_uri
        indexer.scan().await.unwrap(); // fails, retry 1
        indexer.scan().await.unwrap(); // fails, retry 2 -> invalid

        let item = storage.get_item(1, &CONTRACT, &token).await.unwrap().unwrap();
        assert_eq!(item.indexer_state, IndexerState::Invalid);

        // Parked items are not polled again.
        indexer.scan().await.unwrap();
        let item = storage.get_item(1, &CONTRACT, &token).await.unwrap().unwrap();
        assert_eq!(item.indexer_state, IndexerState::Invalid);

        // An explicit refresh re-queues with a clean counter.
        assert!(storage
            .request_item_refresh(1, &CONTRACT, &token, 500)
            .await
            .unwrap());
        let item = storage.get_item(1, &CONTRACT, &token).await.unwrap().unwrap();
        assert_eq!(item.indexer_state, IndexerState::NewRefreshing);
        assert_eq!(item.indexer_retry_count, 0);

        // The refresh track re-resolves the URI.
        indexer.scan().await.unwrap();
        let item = storage.get_item(1, &CONTRACT, &token).await.unwrap().unwrap();
        assert_eq!(item.indexer_state, IndexerState::HasTokenUriRefreshing);
    }

    #[tokio::test]
    async fn test_animation_stage_hosts_asset() {
        let (storage, _temp_db) = test_storage().await;
        let media_dir = tempfile::tempdir().unwrap();
        let token = U256::from(3u64);
        seed_item(&storage, token).await;

        let metadata = serde_json::json!({
            "image": "https://img.example/3.png",
            "animation_url": "https://anim.example/3.mp4",
            "attributes": [{"trait_type": "Fur", "value": "Zombie"}]
        });
        let mut fetcher = MapFetcher::default();
        fetcher.responses.insert(
            "https://meta.example/3".to_string(),
            (metadata.to_string().into_bytes(), "application/json".into()),
        );
        fetcher.responses.insert(
            "https://img.example/3.png".to_string(),
            (b"img".to_vec(), "image/png".into()),
        );
        fetcher.responses.insert(
            "https://anim.example/3.mp4".to_string(),
            (b"vid".to_vec(), "video/mp4".into()),
        );

        let indexer = indexer(
            storage.clone(),
            HashMap::from([(token, "https://meta.example/3".to_string())]),
            fetcher,
            media_dir.path(),
        );
        for _ in 0..6 {
            indexer.scan().await.unwrap();
        }

        let item = storage.get_item(1, &CONTRACT, &token).await.unwrap().unwrap();
        assert_eq!(item.indexer_state, IndexerState::Done);
        assert_eq!(item.animation_url, "https://anim.example/3.mp4");
        assert!(item.hosted_animation_url.ends_with("/3.animation.mp4"));
        assert_eq!(item.content_type, "video/mp4");
    }

    #[test]
    fn test_data_uri_decoding() {
        let json = r#"{"image":"x"}"#;
        let encoded = base64::engine::general_purpose::STANDARD.encode(json);
        let (bytes, media_type) =
            decode_data_uri(&format!("application/json;base64,{encoded}")).unwrap();
        assert_eq!(bytes, json.as_bytes());
        assert_eq!(media_type, "application/json");

        let (bytes, media_type) = decode_data_uri("application/json,{}").unwrap();
        assert_eq!(bytes, b"{}");
        assert_eq!(media_type, "application/json");
    }
}

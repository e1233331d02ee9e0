//! Per-contract log trackers.
//!
//! A tracker follows one contract's logs at a fixed distance behind the
//! chain head, delivers them to an [`EventHandler`] in `(block_number,
//! log_index)` order, and checkpoints the last fully processed block.
//! Block hashes are pinned along the way; when a pinned hash stops
//! matching the chain, the tracker rewinds to the last common ancestor
//! and re-processes from there.

use alloy::primitives::{Address, B256};
use alloy::rpc::types::{Filter, Log};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use nfttrack_core::{MAX_BACKOFF_SECS, MAX_CONSECUTIVE_BACKOFFS};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handlers::{EventHandler, LogEnvelope};
use crate::rpc::{BlockMetaCache, CurrentBlockOracle, ThrottledClient, WsPool};
use crate::storage::Storage;

/// Live log feed handed out by [`LogSource::subscribe`].
pub type LogStream = Pin<Box<dyn Stream<Item = Log> + Send>>;

/// Raised when a reorg reaches past the rewind window. Unrecoverable
/// without operator intervention, so it shuts the process down.
#[derive(Debug, thiserror::Error)]
#[error("reorg at block {at} deeper than the rewind window of {window} blocks")]
pub struct ReorgTooDeep {
    pub at: u64,
    pub window: u64,
}

/// Chain access as the tracker sees it. Split out so tests can drive the
/// tracker against a scripted chain.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Latest block number known (0 before the first head arrives).
    async fn latest_block(&self) -> u64;

    /// Logs of one contract and topic set over an inclusive range.
    async fn fetch_logs(
        &self,
        address: Address,
        topics: &[B256],
        from: u64,
        to: u64,
        archive: bool,
    ) -> Result<Vec<Log>>;

    /// Cached hash/timestamp of a block, persisted for reorg checks.
    async fn block_meta(&self, number: u64) -> Result<(B256, u64)>;

    /// Hash/timestamp straight from the node, bypassing the cache.
    async fn chain_block_meta(&self, number: u64) -> Result<Option<(B256, u64)>>;

    /// Sender of a transaction.
    async fn tx_sender(&self, tx_hash: B256) -> Result<Option<Address>>;

    /// Drop pinned block state at or above a height.
    async fn invalidate_blocks_from(&self, number: u64) -> Result<()>;

    /// Live subscription with the tracker's filter, opened once the
    /// catch-up phase is over. Incoming entries (reorg notices included)
    /// wake the tracker immediately instead of waiting out a poll
    /// interval; dispatch itself still flows through the checkpointed
    /// fetch path. `None` means the source cannot stream and the tracker
    /// stays on its polling cadence.
    async fn subscribe(&self, address: Address, topics: &[B256]) -> Result<Option<LogStream>> {
        let _ = (address, topics);
        Ok(None)
    }
}

/// Production [`LogSource`] over the throttled client, head oracle and
/// block cache.
pub struct RpcLogSource {
    client: ThrottledClient,
    oracle: CurrentBlockOracle,
    cache: Arc<BlockMetaCache>,
    ws: Arc<WsPool>,
    /// Ranges ending further behind the head than this go to the archive
    /// endpoint.
    archive_lag: u64,
}

impl RpcLogSource {
    pub fn new(
        client: ThrottledClient,
        oracle: CurrentBlockOracle,
        cache: Arc<BlockMetaCache>,
        ws: Arc<WsPool>,
        archive_lag: u64,
    ) -> Self {
        Self {
            client,
            oracle,
            cache,
            ws,
            archive_lag,
        }
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    async fn latest_block(&self) -> u64 {
        self.oracle.latest()
    }

    async fn fetch_logs(
        &self,
        address: Address,
        topics: &[B256],
        from: u64,
        to: u64,
        archive: bool,
    ) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .address(address)
            .event_signature(topics.to_vec())
            .from_block(from)
            .to_block(to);
        let archive = archive || self.oracle.latest().saturating_sub(to) > self.archive_lag;
        self.client.get_logs(&filter, archive).await
    }

    async fn block_meta(&self, number: u64) -> Result<(B256, u64)> {
        self.cache.get(number).await
    }

    async fn chain_block_meta(&self, number: u64) -> Result<Option<(B256, u64)>> {
        self.client.get_block_meta(number).await
    }

    async fn tx_sender(&self, tx_hash: B256) -> Result<Option<Address>> {
        Ok(self.client.get_transaction(tx_hash).await?.map(|tx| tx.from))
    }

    async fn invalidate_blocks_from(&self, number: u64) -> Result<()> {
        self.cache.invalidate_from(number).await
    }

    async fn subscribe(&self, address: Address, topics: &[B256]) -> Result<Option<LogStream>> {
        let filter = Filter::new()
            .address(address)
            .event_signature(topics.to_vec());
        let subscription = self.ws.subscribe_logs(&filter).await?;
        Ok(Some(Box::pin(subscription.into_stream())))
    }
}

/// Static parameters of one tracker.
#[derive(Debug, Clone)]
pub struct TrackerParams {
    pub chain_id: u64,
    pub address: Address,
    /// First block the contract is relevant from.
    pub start_block: u64,
    /// Blocks to stay behind the head.
    pub follow_distance: u64,
    /// Widest log query range; halved on oversized-response errors.
    pub range_limit: u64,
    pub block_time_secs: u64,
}

#[derive(Debug)]
enum Step {
    /// Work was done; checkpoint moved (or a rewind happened).
    Progressed,
    /// Nothing to do yet.
    Idle,
}

/// Follows one contract's logs and feeds them to a handler.
pub struct LogTracker {
    params: TrackerParams,
    tag: String,
    storage: Storage,
    source: Arc<dyn LogSource>,
    handler: Arc<dyn EventHandler>,
}

impl LogTracker {
    pub fn new(
        params: TrackerParams,
        storage: Storage,
        source: Arc<dyn LogSource>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let tag = format!(
            "{}:{:#x}:{}",
            params.chain_id,
            params.address,
            handler.name()
        );
        Self {
            params,
            tag,
            storage,
            source,
            handler,
        }
    }

    /// Checkpoint tag, unique per `(chain, contract, handler)`.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Run until cancelled or a fatal error.
    ///
    /// Transient errors back off exponentially (capped at
    /// [`MAX_BACKOFF_SECS`]); after [`MAX_CONSECUTIVE_BACKOFFS`] failures
    /// in a row the error propagates to the supervisor.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(tag = %self.tag, "Tracker starting");
        let mut backoffs: u32 = 0;
        let mut live: Option<LogStream> = None;

        loop {
            if shutdown.is_cancelled() {
                info!(tag = %self.tag, "Tracker stopping");
                return Ok(());
            }

            match self.step().await {
                Ok(Step::Progressed) => {
                    backoffs = 0;
                }
                Ok(Step::Idle) => {
                    backoffs = 0;
                    if live.is_none() {
                        live = self.open_subscription().await;
                    }
                    self.wait_for_work(&mut live, &shutdown).await;
                }
                Err(e) if e.downcast_ref::<ReorgTooDeep>().is_some() => {
                    return Err(e).with_context(|| format!("tracker {}", self.tag));
                }
                Err(e) => {
                    backoffs += 1;
                    if backoffs >= MAX_CONSECUTIVE_BACKOFFS {
                        return Err(e).with_context(|| {
                            format!("tracker {} failed {backoffs} times in a row", self.tag)
                        });
                    }
                    let delay = (self.params.block_time_secs << backoffs).min(MAX_BACKOFF_SECS);
                    warn!(tag = %self.tag, backoffs, "Tracker step failed, retrying in {delay}s: {e:#}");
                    self.pause(Duration::from_secs(delay), &shutdown).await;
                }
            }
        }
    }

    async fn pause(&self, duration: Duration, shutdown: &CancellationToken) {
        tokio::select! {
            () = shutdown.cancelled() => {}
            () = tokio::time::sleep(duration) => {}
        }
    }

    /// Switch from catch-up polling to streaming once the tracker is at
    /// the safe head. A source that cannot stream (or a failed connect)
    /// leaves the tracker on its polling cadence.
    async fn open_subscription(&self) -> Option<LogStream> {
        match self
            .source
            .subscribe(self.params.address, &self.handler.topics())
            .await
        {
            Ok(Some(stream)) => {
                info!(tag = %self.tag, "Streaming live logs");
                Some(stream)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(tag = %self.tag, "Log subscription failed, staying on polling: {err:#}");
                None
            }
        }
    }

    /// Idle until a streamed log arrives or the poll interval elapses.
    /// The stream only wakes the loop; the log itself is re-fetched and
    /// dispatched by the next step, which keeps the follow-distance gate
    /// and ordering in one place.
    async fn wait_for_work(&self, live: &mut Option<LogStream>, shutdown: &CancellationToken) {
        let poll = Duration::from_secs(self.params.block_time_secs);
        match live {
            Some(stream) => {
                tokio::select! {
                    () = shutdown.cancelled() => {}
                    () = tokio::time::sleep(poll) => {}
                    entry = stream.next() => {
                        if entry.is_none() {
                            // Server dropped the subscription; reopen on
                            // the next idle pass.
                            debug!(tag = %self.tag, "Log subscription closed");
                            *live = None;
                        }
                    }
                }
            }
            None => self.pause(poll, shutdown).await,
        }
    }

    async fn step(&self) -> Result<Step> {
        let latest = self.source.latest_block().await;
        let checkpoint = match self.storage.get_tracker_state(&self.tag).await? {
            Some(state) => state.last_block_processed,
            None if self.params.start_block > 0 => self.params.start_block.saturating_sub(1),
            // No configured genesis: begin at the current safe head
            // instead of scanning the whole chain.
            None => latest.saturating_sub(self.params.follow_distance + 1),
        };

        let target = latest.saturating_sub(self.params.follow_distance);
        if latest == 0 || target <= checkpoint {
            return Ok(Step::Idle);
        }

        // The pinned hash of the checkpoint block must still be canonical
        // before building on top of it.
        if checkpoint >= self.params.start_block {
            if let Some(stored) = self.storage.get_block(self.params.chain_id, checkpoint).await? {
                let canonical = self.source.chain_block_meta(checkpoint).await?;
                let matches = matches!(canonical, Some((hash, _)) if hash == stored.hash);
                if !matches {
                    self.rewind(checkpoint).await?;
                    return Ok(Step::Progressed);
                }
            }
        }

        let from = checkpoint + 1;
        let mut range = self.params.range_limit.max(1);

        loop {
            let to = (from + range - 1).min(target);
            match self
                .source
                .fetch_logs(self.params.address, &self.handler.topics(), from, to, false)
                .await
            {
                Ok(logs) => {
                    self.process_range(logs, to).await?;
                    return Ok(Step::Progressed);
                }
                Err(e) if range > 1 => {
                    // Oversized responses and provider range caps both
                    // surface as fetch errors; narrowing the window
                    // resolves either.
                    range /= 2;
                    debug!(tag = %self.tag, range, "Log fetch failed, narrowing range: {e:#}");
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("fetching logs for block {from}"));
                }
            }
        }
    }

    async fn process_range(&self, mut logs: Vec<Log>, to: u64) -> Result<()> {
        logs.retain(|log| !log.removed);
        logs.sort_by_key(|log| (log.block_number.unwrap_or(0), log.log_index.unwrap_or(0)));

        let count = logs.len();
        for log in logs {
            let number = log.block_number.context("log without block number")?;
            let (_, block_time) = self.source.block_meta(number).await?;

            let sender = match (self.handler.wants_tx_sender(), log.transaction_hash) {
                (true, Some(tx_hash)) => self.source.tx_sender(tx_hash).await?,
                _ => None,
            };

            self.handler
                .handle(&LogEnvelope {
                    log,
                    block_time,
                    sender,
                })
                .await?;
        }

        // Pin the range end so the next step can detect a reorg under it.
        self.source.block_meta(to).await?;
        self.storage.upsert_tracker_state(&self.tag, to).await?;

        if count > 0 {
            debug!(tag = %self.tag, count, to, "Processed logs");
        }
        Ok(())
    }

    /// Walk back from a stale checkpoint to the last block whose pinned
    /// hash is still canonical, undo everything above it, and resume from
    /// there.
    async fn rewind(&self, checkpoint: u64) -> Result<()> {
        let window = 2 * self.params.follow_distance.max(1);
        let floor = checkpoint.saturating_sub(window);

        let mut ancestor = None;
        let mut number = checkpoint;
        while number > 0 && number >= self.params.start_block {
            if number < floor {
                return Err(ReorgTooDeep {
                    at: checkpoint,
                    window,
                }
                .into());
            }

            match self.storage.get_block(self.params.chain_id, number).await? {
                Some(stored) => {
                    let canonical = self.source.chain_block_meta(number).await?;
                    if matches!(canonical, Some((hash, _)) if hash == stored.hash) {
                        ancestor = Some(number);
                        break;
                    }
                }
                None => {
                    // Nothing pinned here; safe to rebuild from this point.
                    ancestor = Some(number);
                    break;
                }
            }
            number -= 1;
        }

        let ancestor = ancestor.unwrap_or_else(|| self.params.start_block.saturating_sub(1));

        warn!(
            tag = %self.tag,
            checkpoint,
            ancestor,
            "Reorg detected, rewinding"
        );

        self.handler.on_rewind(ancestor + 1).await?;
        self.source.invalidate_blocks_from(ancestor + 1).await?;
        self.storage.upsert_tracker_state(&self.tag, ancestor).await?;

        Ok(())
    }
}

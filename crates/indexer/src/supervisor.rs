//! Service wiring and lifecycle.
//!
//! One supervisor owns every worker: the block oracle, one log tracker
//! per tracked contract, the token-indexer pipeline, and the stat and
//! price refreshers. Workers report fatal errors on a shared channel;
//! the first one cancels everything, the remaining tasks drain, and the
//! error propagates out of [`Supervisor::run`].

use alloy::primitives::{address, Address};
use anyhow::{Context, Result};
use nfttrack_core::TokenType;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::handlers::{
    Erc1155Handler, Erc721Handler, EventHandler, ExchangeHandler, PunkHandler, RoyaltyHandler,
    StakingHandler,
};
use crate::orderbook::{Erc1271Checker, OrderBook};
use crate::pipeline::{
    metadata, HttpFetcher, MediaStore, ParserRegistry, RpcTokenUriSource, TokenIndexer,
};
use crate::rpc::{BlockMetaCache, CurrentBlockOracle, ThrottledClient, WsPool};
use crate::stats::{PriceUpdater, StatRefresher};
use crate::storage::Storage;
use crate::tracker::{LogSource, LogTracker, RpcLogSource, TrackerParams};

/// Error channel depth; enough that a burst of failures never blocks a
/// dying worker.
const ERROR_CHANNEL_CAPACITY: usize = 10;

/// ApeCoin staking pool ids on mainnet. Pool 0 is bare ApeCoin and has
/// no NFT attached.
const APE_POOLS: [(u64, Address); 3] = [
    (1, address!("bc4ca0eda7647a8ab7c2061c2e118a18a936f13d")),
    (2, address!("60e4d786628fea6478f785a6d7e704777c86a7c6")),
    (3, address!("ba30e5f9bb24caa003e9f2f0497ad287fdf95623")),
];

/// Mutant Ape collection, given a derived "Mutation Type" trait.
const MAYC: Address = address!("60e4d786628fea6478f785a6d7e704777c86a7c6");

/// Otherdeed collection, given a derived "Koda?" trait.
const OTHERDEED: Address = address!("34d85c9cdeb23fa97cb08333b511ac86e1c4e258");

/// Handles of every spawned worker. The catalog rescan keeps adding
/// trackers after boot, so the drain takes batches until no handle is
/// left rather than walking a list frozen at startup.
#[derive(Clone, Default)]
struct TaskSet {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskSet {
    fn push(&self, handle: JoinHandle<()>) {
        self.handles.lock().unwrap().push(handle);
    }

    fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Await every task, including ones pushed while draining.
    async fn drain(&self) {
        loop {
            let batch: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
            if batch.is_empty() {
                return;
            }
            for task in batch {
                let _ = task.await;
            }
        }
    }
}

/// Owns the whole service.
pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    /// Build a supervisor from a validated config.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the service until a shutdown signal or the first fatal error.
    pub async fn run(&self) -> Result<()> {
        let chain_id = self.config.network.chain_id;

        let storage = Storage::new(&self.config.database.url).await?;
        storage.run_migrations().await?;

        let client = ThrottledClient::new(&self.config.network, &self.config.rpc)?;
        let pool = Arc::new(WsPool::new(
            &self.config.network.ws_url,
            self.config.rpc.ws_rotate_limit,
        ));
        let oracle = CurrentBlockOracle::new();
        let cache = Arc::new(BlockMetaCache::new(chain_id, storage.clone(), client.clone()));
        let source: Arc<dyn LogSource> = Arc::new(RpcLogSource::new(
            client.clone(),
            oracle.clone(),
            cache,
            pool.clone(),
            self.config.tracker.range_limit,
        ));
        let orderbook = OrderBook::new(
            chain_id,
            &self.config.contracts,
            &self.config.pay_tokens,
            storage.clone(),
            Arc::new(Erc1271Checker::new(client.clone())),
        );

        let shutdown = CancellationToken::new();
        let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(ERROR_CHANNEL_CAPACITY);
        let tasks = TaskSet::default();

        // Head feed.
        {
            let oracle = oracle.clone();
            let pool = pool.clone();
            let shutdown = shutdown.clone();
            let err_tx = err_tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = oracle.run(&pool, shutdown).await {
                    let _ = err_tx.send(err.context("block oracle failed")).await;
                }
            }));
        }

        // Fixed contracts from config.
        self.spawn_tracker(
            &tasks,
            self.config.contracts.exchange,
            Arc::new(ExchangeHandler::new(chain_id, storage.clone(), orderbook.clone())),
            &source,
            &storage,
            &shutdown,
            &err_tx,
        );
        if let Some(registry) = self.config.contracts.royalty_registry {
            self.spawn_tracker(
                &tasks,
                registry,
                Arc::new(RoyaltyHandler::new(chain_id, storage.clone())),
                &source,
                &storage,
                &shutdown,
                &err_tx,
            );
        }
        if let Some(staking) = self.config.contracts.apecoin_staking {
            self.spawn_tracker(
                &tasks,
                staking,
                Arc::new(StakingHandler::new(
                    chain_id,
                    APE_POOLS.into_iter().collect(),
                    storage.clone(),
                )),
                &source,
                &storage,
                &shutdown,
                &err_tx,
            );
        }
        if let Some(punk) = self.config.contracts.punk {
            self.spawn_tracker(
                &tasks,
                punk,
                Arc::new(PunkHandler::new(chain_id, punk, storage.clone(), orderbook.clone())),
                &source,
                &storage,
                &shutdown,
                &err_tx,
            );
        }

        // Catalog contracts, plus a rescan loop that picks up contracts
        // marked appropriate after boot.
        let mut running: HashSet<Address> = HashSet::new();
        self.spawn_catalog_trackers(
            &tasks,
            &mut running,
            &orderbook,
            &source,
            &storage,
            &shutdown,
            &err_tx,
        )
        .await?;
        {
            let supervisor = Supervisor {
                config: self.config.clone(),
            };
            let orderbook = orderbook.clone();
            let source = source.clone();
            let storage = storage.clone();
            let shutdown_clone = shutdown.clone();
            let err_tx_clone = err_tx.clone();
            let rescan_tasks = tasks.clone();
            let interval_secs = self.config.tracker.check_new_contract_interval_secs;
            tasks.push(tokio::spawn(async move {
                let mut running = running;
                let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = shutdown_clone.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    if let Err(err) = supervisor
                        .spawn_catalog_trackers(
                            &rescan_tasks,
                            &mut running,
                            &orderbook,
                            &source,
                            &storage,
                            &shutdown_clone,
                            &err_tx_clone,
                        )
                        .await
                    {
                        warn!("Catalog rescan failed: {err:#}");
                    }
                }
            }));
        }

        // Token-indexer pipeline.
        {
            let parsers = self.build_parser_registry(chain_id);
            let indexer = TokenIndexer::new(
                storage.clone(),
                Arc::new(RpcTokenUriSource::new(client.clone())),
                Arc::new(HttpFetcher::new(&self.config.indexer)?),
                Arc::new(parsers),
                MediaStore::new(&self.config.media),
                self.config.indexer.clone(),
            );
            let shutdown = shutdown.clone();
            let err_tx = err_tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = indexer.run(shutdown).await {
                    let _ = err_tx.send(err.context("token indexer failed")).await;
                }
            }));
        }

        // Stat and price refreshers.
        {
            let refresher =
                StatRefresher::new(chain_id, storage.clone(), self.config.stats.clone());
            let shutdown = shutdown.clone();
            let err_tx = err_tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = refresher.run(shutdown).await {
                    let _ = err_tx.send(err.context("stat refresher failed")).await;
                }
            }));
        }
        {
            let updater = PriceUpdater::new(
                chain_id,
                storage.clone(),
                orderbook.clone(),
                self.config.price_updater.clone(),
            );
            let shutdown = shutdown.clone();
            let err_tx = err_tx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(err) = updater.run(shutdown).await {
                    let _ = err_tx.send(err.context("price updater failed")).await;
                }
            }));
        }
        drop(err_tx);

        info!(chain_id, workers = tasks.len(), "Service started");
        let fatal = tokio::select! {
            maybe_err = err_rx.recv() => maybe_err,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                None
            }
        };

        shutdown.cancel();
        tasks.drain().await;
        storage.close().await;

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Spawn trackers for every catalog contract not already running.
    /// The boot-time punk contract has its own config entry and is
    /// skipped here.
    #[allow(clippy::too_many_arguments)]
    async fn spawn_catalog_trackers(
        &self,
        tasks: &TaskSet,
        running: &mut HashSet<Address>,
        orderbook: &OrderBook,
        source: &Arc<dyn LogSource>,
        storage: &Storage,
        shutdown: &CancellationToken,
        err_tx: &mpsc::Sender<anyhow::Error>,
    ) -> Result<()> {
        let chain_id = self.config.network.chain_id;
        for entry in storage.list_appropriate_contracts(chain_id).await? {
            if !running.insert(entry.address) {
                continue;
            }
            let handler: Arc<dyn EventHandler> = match entry.token_type {
                TokenType::Erc1155 => Arc::new(Erc1155Handler::new(
                    chain_id,
                    entry.address,
                    storage.clone(),
                    orderbook.clone(),
                )),
                TokenType::Punk => continue,
                _ => Arc::new(Erc721Handler::new(
                    chain_id,
                    entry.address,
                    storage.clone(),
                    orderbook.clone(),
                )),
            };
            info!(address = %entry.address, kind = entry.token_type.as_str(), "Tracking contract");
            self.spawn_tracker(tasks, entry.address, handler, source, storage, shutdown, err_tx);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_tracker(
        &self,
        tasks: &TaskSet,
        address: Address,
        handler: Arc<dyn EventHandler>,
        source: &Arc<dyn LogSource>,
        storage: &Storage,
        shutdown: &CancellationToken,
        err_tx: &mpsc::Sender<anyhow::Error>,
    ) {
        let tracker = LogTracker::new(
            TrackerParams {
                chain_id: self.config.network.chain_id,
                address,
                start_block: 0,
                follow_distance: self.config.tracker.follow_distance,
                range_limit: self.config.tracker.range_limit,
                block_time_secs: self.config.network.block_time_secs,
            },
            storage.clone(),
            source.clone(),
            handler,
        );
        let shutdown = shutdown.clone();
        let err_tx = err_tx.clone();
        tasks.push(tokio::spawn(async move {
            let tag = tracker.tag().to_string();
            if let Err(err) = tracker.run(shutdown).await {
                let _ = err_tx
                    .send(err.context(format!("tracker {tag} failed")))
                    .await;
            }
        }));
    }

    /// Per-collection metadata decorators; only meaningful on mainnet.
    fn build_parser_registry(&self, chain_id: u64) -> ParserRegistry {
        let mut parsers = ParserRegistry::new();
        if chain_id == 1 {
            parsers.register(chain_id, MAYC, metadata::mutation_type_decorator);
            parsers.register(chain_id, OTHERDEED, metadata::presence_flag("koda", "Koda?"));
        }
        parsers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_drain_awaits_tasks_added_after_boot() {
        let tasks = TaskSet::default();
        let late_done = Arc::new(AtomicBool::new(false));

        // Mirrors the rescan loop: a running worker registers another
        // worker after the initial spawn batch.
        let inner_tasks = tasks.clone();
        let flag = late_done.clone();
        tasks.push(tokio::spawn(async move {
            inner_tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
            }));
        }));

        tasks.drain().await;
        assert!(late_done.load(Ordering::SeqCst));
        assert_eq!(tasks.len(), 0);
    }
}

//! Process-wide view of the chain head.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::WsPool;

/// Shared latest-block-number cell.
///
/// One background task feeds it from a header subscription; every tracker
/// reads it instead of polling `eth_blockNumber`.
#[derive(Debug, Clone, Default)]
pub struct CurrentBlockOracle {
    latest: Arc<AtomicU64>,
}

impl CurrentBlockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest block number seen, or 0 before the first header arrives.
    pub fn latest(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    /// Record a newer head. Stale numbers are ignored.
    pub fn advance(&self, number: u64) {
        self.latest.fetch_max(number, Ordering::AcqRel);
    }

    /// Feed the oracle from a header subscription until shutdown.
    ///
    /// Subscription drops are retried after a short pause; the oracle keeps
    /// serving the last known head in the meantime.
    pub async fn run(&self, pool: &WsPool, shutdown: CancellationToken) -> Result<()> {
        loop {
            let mut sub = tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                sub = pool.subscribe_blocks() => match sub {
                    Ok(sub) => sub,
                    Err(e) => {
                        warn!("Block subscription failed: {e:#}");
                        tokio::select! {
                            () = shutdown.cancelled() => return Ok(()),
                            () = tokio::time::sleep(Duration::from_secs(5)) => continue,
                        }
                    }
                },
            };

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return Ok(()),
                    header = sub.recv() => match header {
                        Ok(header) => {
                            debug!(number = header.number, "New head");
                            self.advance(header.number);
                        }
                        Err(e) => {
                            warn!("Block subscription lapsed: {e}");
                            break;
                        }
                    },
                }
            }
        }
    }
}

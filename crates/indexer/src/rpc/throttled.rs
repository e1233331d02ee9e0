//! Throttled HTTP RPC client.

use alloy::eips::{BlockNumberOrTag, BlockId};
use alloy::network::TransactionBuilder;
use alloy::primitives::{Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{BlockTransactionsKind, Filter, Log, Transaction, TransactionRequest};
use alloy::transports::http::{Client, Http};
use anyhow::{Context, Result};
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, OwnedSemaphorePermit};

use crate::config::{NetworkConfig, RpcConfig};

/// Fair admission gate for outbound RPC calls.
///
/// Wraps a FIFO semaphore: callers are served in arrival order, so a
/// component issuing thousands of calls cannot starve one issuing few.
#[derive(Debug, Clone)]
pub struct PermitGate {
    permits: Arc<Semaphore>,
}

impl PermitGate {
    /// Create a gate admitting at most `max_concurrent` calls at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    /// Wait for a slot. The returned permit releases on drop.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .context("RPC permit gate closed")
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// HTTP RPC client shared by every component.
///
/// Historical queries go to the archive endpoint when one is configured,
/// everything else to the primary. All calls pass the permit gate and run
/// under a per-call timeout.
#[derive(Clone)]
pub struct ThrottledClient {
    provider: RootProvider<Http<Client>>,
    archive_provider: Option<RootProvider<Http<Client>>>,
    gate: PermitGate,
    call_timeout: Duration,
}

impl ThrottledClient {
    /// Create a client from the network and RPC sections of the config.
    pub fn new(network: &NetworkConfig, rpc: &RpcConfig) -> Result<Self> {
        let url = network
            .rpc_url
            .parse()
            .with_context(|| format!("Invalid RPC URL: {}", network.rpc_url))?;
        let provider = ProviderBuilder::new().on_http(url);

        let archive_provider = match &network.archive_rpc_url {
            Some(raw) => {
                let url = raw
                    .parse()
                    .with_context(|| format!("Invalid archive RPC URL: {raw}"))?;
                Some(ProviderBuilder::new().on_http(url))
            }
            None => None,
        };

        Ok(Self {
            provider,
            archive_provider,
            gate: PermitGate::new(rpc.max_concurrent_calls),
            call_timeout: Duration::from_secs(rpc.call_timeout_secs),
        })
    }

    /// The shared permit gate, for components that batch their own calls.
    pub fn gate(&self) -> &PermitGate {
        &self.gate
    }

    /// Latest block number from the primary endpoint.
    pub async fn get_block_number(&self) -> Result<u64> {
        let _permit = self.gate.acquire().await?;
        self.timed(self.provider.get_block_number())
            .await?
            .context("Failed to get block number")
    }

    /// Event logs matching a filter.
    ///
    /// Ranges far behind the head belong on the archive endpoint; pass
    /// `archive = true` for catch-up traffic.
    pub async fn get_logs(&self, filter: &Filter, archive: bool) -> Result<Vec<Log>> {
        let _permit = self.gate.acquire().await?;
        let provider = self.pick(archive);
        self.timed(provider.get_logs(filter))
            .await?
            .context("Failed to fetch logs from RPC")
    }

    /// Hash and timestamp of a block, if the node knows it.
    pub async fn get_block_meta(&self, number: u64) -> Result<Option<(B256, u64)>> {
        let _permit = self.gate.acquire().await?;
        let block = self
            .timed(self.provider.get_block_by_number(
                BlockNumberOrTag::Number(number),
                BlockTransactionsKind::Hashes,
            ))
            .await?
            .context("Failed to fetch block")?;

        Ok(block.map(|b| (b.header.hash, b.header.timestamp)))
    }

    /// Full transaction by hash (for transfer sender lookups).
    pub async fn get_transaction(&self, tx_hash: B256) -> Result<Option<Transaction>> {
        let _permit = self.gate.acquire().await?;
        self.timed(self.provider.get_transaction_by_hash(tx_hash))
            .await?
            .context("Failed to fetch transaction")
    }

    /// Read-only contract call at the latest block.
    pub async fn call(&self, tx: &TransactionRequest) -> Result<Bytes> {
        let _permit = self.gate.acquire().await?;
        self.timed(self.provider.call(tx).into_future())
            .await?
            .context("Contract call failed")
    }

    /// Read-only contract call at a specific block (archive endpoint when
    /// available).
    pub async fn call_at(&self, tx: &TransactionRequest, block: u64) -> Result<Bytes> {
        let _permit = self.gate.acquire().await?;
        let provider = self.pick(true);
        self.timed(provider.call(tx).block(BlockId::number(block)).into_future())
            .await?
            .context("Contract call failed")
    }

    fn pick(&self, archive: bool) -> &RootProvider<Http<Client>> {
        if archive {
            self.archive_provider.as_ref().unwrap_or(&self.provider)
        } else {
            &self.provider
        }
    }

    async fn timed<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| anyhow::anyhow!("RPC call timed out after {:?}", self.call_timeout))
    }
}

/// Build an unsigned call request for `eth_call` against a contract.
pub fn call_request(to: alloy::primitives::Address, input: Bytes) -> TransactionRequest {
    TransactionRequest::default().with_to(to).with_input(input)
}

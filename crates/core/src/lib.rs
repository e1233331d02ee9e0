//! # nfttrack-core
//!
//! Core types, constants, and hashing primitives for the NFT event
//! tracker. This crate is the chain-agnostic plumbing shared by the
//! indexer service:
//!
//! - **Domain types**: token type, indexer state, activity kind, order
//!   strategy, price source
//! - **Constants**: follow distance, range limits, retry caps, the
//!   EIP-712 domain of the exchange
//! - **Hashing**: the EIP-712 maker-order hash and the per-item order
//!   hash, bit-exact with the on-chain exchange contract

#![warn(missing_docs)]

pub mod constants;
pub mod error;
pub mod hashing;
pub mod types;

pub use constants::*;
pub use error::{CoreError, Result};
pub use hashing::{exchange_domain, hash_order, hash_order_item, recover_order_signer};
pub use types::*;

// Re-export Alloy primitives for convenience
pub use alloy_primitives::{keccak256, Address, B256, U256};

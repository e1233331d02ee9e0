//! NFT event tracker service.
//!
//! This crate watches a set of on-chain contracts, streams their logs
//! with a safety lag, decodes them into domain events, and reconciles a
//! document-store view of collections, tokens, holdings, orders, sales
//! and trading volume.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ nfttrack-indexer                                       │
//! │                                                        │
//! │  ┌──────────────┐    ┌──────────────┐                  │
//! │  │ block oracle │    │ ws pool      │ ← chain ws       │
//! │  └──────┬───────┘    └──────┬───────┘                  │
//! │         │                   │                          │
//! │  ┌──────▼───────────────────▼──────┐                   │
//! │  │ per-contract log trackers       │ ← throttled RPC   │
//! │  │ exchange / 721 / 1155 / punk /  │                   │
//! │  │ royalty / staking               │                   │
//! │  └──────┬──────────────────────────┘                   │
//! │         │ decoded events, (block, logIndex) order      │
//! │  ┌──────▼──────┐  ┌────────────┐  ┌─────────────────┐  │
//! │  │ handlers    │→ │ order book │  │ token indexer   │  │
//! │  │ (reducers)  │  │            │  │ pipeline        │  │
//! │  └──────┬──────┘  └─────┬──────┘  └───────┬─────────┘  │
//! │         │               │                 │            │
//! │  ┌──────▼───────────────▼─────────────────▼─────────┐  │
//! │  │ storage (items, holdings, orders, activity, …)   │  │
//! │  └──────────────────────┬───────────────────────────┘  │
//! │                         │                              │
//! │                  ┌──────▼──────┐                       │
//! │                  │ stat/price  │ (timer-driven)        │
//! │                  │ refreshers  │                       │
//! │                  └─────────────┘                       │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The supervisor wires all of the above, owns the shared error
//! channel, and cancels every worker on the first fatal error.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod handlers;
pub mod orderbook;
pub mod pipeline;
pub mod rpc;
pub mod stats;
pub mod storage;
pub mod supervisor;
pub mod tracker;

pub use nfttrack_core as core;

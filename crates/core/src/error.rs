//! Error types for the core crate.
//!
//! The variants follow the engine's failure taxonomy: invalid-input
//! errors surface to order-book callers, duplicates are swallowed by
//! reducers, and everything else is classified at the service layer.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Order nonce is below the signer's minimum valid nonce.
    #[error("Invalid order nonce: {nonce} (minimum valid nonce is {min_valid})")]
    InvalidOrderNonce {
        /// Nonce carried by the rejected order.
        nonce: u64,
        /// Signer's current minimum valid nonce.
        min_valid: u64,
    },

    /// An order with the same (chain, signer, nonce) already exists.
    #[error("Duplicate order nonce: {0}")]
    DuplicateOrderNonce(u64),

    /// Neither EOA recovery nor EIP-1271 accepted the signature.
    #[error("Invalid order signature")]
    InvalidSignature,

    /// Strategy/side combination is not allowed.
    #[error("Invalid strategy for order side: {0}")]
    InvalidStrategy(String),

    /// Currency is not a known pay token.
    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    /// Token type string is not one of 721/1155/punk.
    #[error("Invalid token type: {0}")]
    InvalidTokenType(String),

    /// Indexer state string is not part of the lifecycle.
    #[error("Invalid indexer state: {0}")]
    InvalidIndexerState(String),

    /// Activity kind string is unknown.
    #[error("Invalid activity kind: {0}")]
    InvalidActivityKind(String),

    /// Order strategy string is unknown.
    #[error("Invalid order strategy: {0}")]
    InvalidOrderStrategy(String),

    /// Trading period string is unknown.
    #[error("Invalid trading period: {0}")]
    InvalidTradingPeriod(String),

    /// Invalid hex encoding.
    #[error("Invalid hex encoding")]
    InvalidHex,

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// True for errors the order-book rejects to its caller without
    /// affecting the engine (the `ErrInvalid*` class).
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidOrderNonce { .. }
                | CoreError::DuplicateOrderNonce(_)
                | CoreError::InvalidSignature
                | CoreError::InvalidStrategy(_)
                | CoreError::UnknownCurrency(_)
                | CoreError::InvalidHex
        )
    }
}

/// Result type alias for CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;

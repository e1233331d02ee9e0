//! Order hashing for the exchange.
//!
//! Two hashes matter here and both must be bit-exact with the on-chain
//! contract:
//!
//! - the EIP-712 maker-order hash, `keccak256("\x19\x01" ||
//!   domainSeparator || structHash)`, which the maker signs;
//! - the per-item order hash, the keccak of the tuple-ABI encoding of
//!   one item of the order plus its index, which the contract emits on
//!   cancel and fill.

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_sol_types::{sol, Eip712Domain, SolStruct, SolValue};

use crate::constants::{EXCHANGE_DOMAIN_NAME, EXCHANGE_DOMAIN_VERSION};
use crate::error::CoreError;

sol! {
    /// One item of a maker order, as typed in the exchange contract.
    #[derive(Debug, PartialEq, Eq)]
    struct OrderItem {
        address collection;
        uint256 tokenId;
        uint256 amount;
        uint256 price;
    }

    /// The signed maker order, as typed in the exchange contract.
    #[derive(Debug, PartialEq, Eq)]
    struct MakerOrder {
        bool isAsk;
        address signer;
        OrderItem[] items;
        address strategy;
        address currency;
        uint256 nonce;
        uint256 startTime;
        uint256 endTime;
        uint256 minPercentageToAsk;
        bytes params;
    }

    /// Hash input for a single order item. The contract identifies a
    /// fillable unit by the keccak of this tuple's ABI encoding.
    #[derive(Debug)]
    struct OrderItemHashInput {
        bool isAsk;
        address signer;
        uint256 itemIdx;
        OrderItem item;
        address strategy;
        address currency;
        uint256 nonce;
        uint256 startTime;
        uint256 endTime;
        uint256 minPercentageToAsk;
        bytes params;
    }
}

/// The exchange's EIP-712 domain for a chain/contract pair.
pub fn exchange_domain(chain_id: u64, verifying_contract: Address) -> Eip712Domain {
    Eip712Domain::new(
        Some(EXCHANGE_DOMAIN_NAME.into()),
        Some(EXCHANGE_DOMAIN_VERSION.into()),
        Some(U256::from(chain_id)),
        Some(verifying_contract),
        None,
    )
}

/// Compute the EIP-712 signing hash of a maker order.
pub fn hash_order(order: &MakerOrder, chain_id: u64, verifying_contract: Address) -> B256 {
    let domain = exchange_domain(chain_id, verifying_contract);
    order.eip712_signing_hash(&domain)
}

/// Compute the deterministic hash of one item of a maker order.
///
/// `item_idx` is the item's position inside `order.items`; the supplied
/// index must belong to the order or the hash will not match on-chain
/// events.
pub fn hash_order_item(order: &MakerOrder, item_idx: usize) -> Result<B256, CoreError> {
    let item = order
        .items
        .get(item_idx)
        .ok_or_else(|| CoreError::Other(format!("order has no item at index {item_idx}")))?;

    let input = OrderItemHashInput {
        isAsk: order.isAsk,
        signer: order.signer,
        itemIdx: U256::from(item_idx),
        item: item.clone(),
        strategy: order.strategy,
        currency: order.currency,
        nonce: order.nonce,
        startTime: order.startTime,
        endTime: order.endTime,
        minPercentageToAsk: order.minPercentageToAsk,
        params: order.params.clone(),
    };

    Ok(keccak256(input.abi_encode()))
}

/// Recover the EOA that signed an order digest.
///
/// Accepts both legacy (27/28) and raw (0/1) `v` values.
pub fn recover_order_signer(digest: B256, v: u8, r: B256, s: B256) -> Result<Address, CoreError> {
    let parity = match v {
        0 | 27 => false,
        1 | 28 => true,
        _ => return Err(CoreError::InvalidSignature),
    };

    let signature = alloy_primitives::PrimitiveSignature::new(
        U256::from_be_bytes(r.0),
        U256::from_be_bytes(s.0),
        parity,
    );

    signature
        .recover_address_from_prehash(&digest)
        .map_err(|_| CoreError::InvalidSignature)
}

/// Decode the reserved buyer of a private sale from the order params.
///
/// The contract encodes the counterparty as the first 32-byte word of
/// `params` (an ABI-encoded address).
pub fn decode_reserved_buyer(params: &[u8]) -> Option<Address> {
    if params.len() < 32 {
        return None;
    }
    Some(Address::from_slice(&params[12..32]))
}

//! OpenRarity-style information scores.
//!
//! A trait carried by few tokens is worth more bits than a common one;
//! an item's score is the sum over its traits of `-log2(count / supply)`.
//! Scores only compare within one collection, so they are recomputed
//! whenever the collection's trait histogram changes.

use alloy::primitives::U256;
use nfttrack_core::Attribute;
use std::collections::BTreeMap;

/// Trait histogram: trait type -> value -> number of items carrying it.
pub type TraitHistogram = BTreeMap<String, BTreeMap<String, u64>>;

/// Information score of one item's trait set.
///
/// Traits absent from the histogram contribute nothing; a zero supply
/// scores zero.
pub fn score(attributes: &[Attribute], histogram: &TraitHistogram, supply: u64) -> f64 {
    if supply == 0 {
        return 0.0;
    }
    attributes
        .iter()
        .filter_map(|attribute| {
            let count = *histogram.get(&attribute.trait_type)?.get(&attribute.value)?;
            if count == 0 {
                return None;
            }
            Some(-((count as f64) / (supply as f64)).log2())
        })
        .sum()
}

/// Score and rank every item of a collection.
///
/// Rank 1 is the rarest. Ties break on ascending token id so ranks are
/// stable across recomputes.
pub fn rank(
    items: &[(U256, Vec<Attribute>)],
    histogram: &TraitHistogram,
    supply: u64,
) -> Vec<(U256, u64, f64)> {
    let mut scored: Vec<(U256, f64)> = items
        .iter()
        .map(|(token_id, attributes)| (*token_id, score(attributes, histogram, supply)))
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored
        .into_iter()
        .enumerate()
        .map(|(idx, (token_id, score))| (token_id, idx as u64 + 1, score))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram() -> TraitHistogram {
        let mut h = TraitHistogram::new();
        h.entry("Fur".to_string())
            .or_default()
            .insert("Robot".to_string(), 1);
        h.entry("Fur".to_string())
            .or_default()
            .insert("Plain".to_string(), 9);
        h
    }

    #[test]
    fn test_rare_trait_scores_higher() {
        let h = histogram();
        let robot = score(&[Attribute::new("Fur", "Robot")], &h, 10);
        let plain = score(&[Attribute::new("Fur", "Plain")], &h, 10);
        assert!(robot > plain);
        // 1-in-10 trait is worth log2(10) bits.
        assert!((robot - 10f64.log2()).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_trait_and_zero_supply_score_nothing() {
        let h = histogram();
        assert_eq!(score(&[Attribute::new("Hat", "Crown")], &h, 10), 0.0);
        assert_eq!(score(&[Attribute::new("Fur", "Robot")], &h, 0), 0.0);
    }

    #[test]
    fn test_rank_orders_rarest_first_with_stable_ties() {
        let h = histogram();
        let items = vec![
            (U256::from(1u64), vec![Attribute::new("Fur", "Plain")]),
            (U256::from(2u64), vec![Attribute::new("Fur", "Robot")]),
            (U256::from(3u64), vec![Attribute::new("Fur", "Plain")]),
        ];
        let ranked = rank(&items, &h, 10);
        assert_eq!(ranked[0].0, U256::from(2u64));
        assert_eq!(ranked[0].1, 1);
        // Tied plain items keep token-id order.
        assert_eq!(ranked[1].0, U256::from(1u64));
        assert_eq!(ranked[2].0, U256::from(3u64));
        assert_eq!(ranked[1].1, 2);
        assert_eq!(ranked[2].1, 3);
    }
}

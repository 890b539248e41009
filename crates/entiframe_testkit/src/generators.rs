//! Property-based test generators using proptest.
//!
//! Strategies here produce inputs that respect the fixture models'
//! invariants: non-empty identifiers, distinct keys, bounded collections.

use crate::fixtures::{EngineKind, VehicleKind, ANIMAL_KINDS};
use entiframe_core::Config;
use proptest::prelude::*;

/// Strategy for identifiers usable as text keys.
pub fn identifier_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,11}").expect("Invalid regex")
}

/// Strategy for discriminator values: mostly known animal kinds, sometimes
/// an arbitrary name that matches none of them.
pub fn discriminator_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => prop::sample::select(ANIMAL_KINDS.to_vec()).prop_map(str::to_string),
        1 => prop::string::string_regex("[A-Z][a-z]{0,9}").expect("Invalid regex"),
    ]
}

/// Strategy for an order's lines as `(sku, quantity)` pairs.
pub fn order_lines_strategy(max_lines: usize) -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec(
        (
            prop::string::string_regex("[A-Z]{3}-[0-9]{3}").expect("Invalid regex"),
            1i64..100,
        ),
        0..=max_lines,
    )
}

/// Strategy for `count` distinct customer ids.
pub fn distinct_ids_strategy(count: std::ops::Range<usize>) -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(identifier_strategy(), count)
        .prop_map(|ids| ids.into_iter().collect())
}

/// Strategy for batching configurations with small caps, so a handful of
/// commands already spans several batches.
pub fn batch_config_strategy() -> impl Strategy<Value = Config> {
    (1usize..6, 2usize..40, 1usize..3).prop_map(|(size, parameters, min)| {
        Config::default()
            .max_batch_size(size)
            .max_batch_parameters(parameters)
            .min_batch_size(min)
    })
}

/// Strategy for a vehicle kind.
pub fn vehicle_kind_strategy() -> impl Strategy<Value = VehicleKind> {
    prop::sample::select(VehicleKind::ALL.to_vec())
}

/// Strategy for an optional engine.
pub fn engine_strategy() -> impl Strategy<Value = Option<EngineKind>> {
    prop::option::of(prop::sample::select(EngineKind::ALL.to_vec()))
}

/// Strategy for a principal/dependent graph: `principals` parents and, for
/// each child, the index of the parent it references.
pub fn parent_child_graph_strategy() -> impl Strategy<Value = (usize, Vec<usize>)> {
    (1usize..5).prop_flat_map(|principals| {
        (
            Just(principals),
            prop::collection::vec(0..principals, 0..8),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn identifiers_are_non_empty(id in identifier_strategy()) {
            prop_assert!(!id.is_empty());
        }

        #[test]
        fn batch_configs_have_positive_caps(config in batch_config_strategy()) {
            prop_assert!(config.max_batch_size >= 1);
            prop_assert!(config.min_batch_size >= 1);
        }

        #[test]
        fn graph_references_existing_parents((parents, children) in parent_child_graph_strategy()) {
            prop_assert!(children.iter().all(|&p| p < parents));
        }
    }
}

//! Property-based test generators using proptest.
//!
//! Provides strategies for people, map operations and map geometries.

use crate::fixtures::{Person, CITIES, TAGS};
use gigamap_core::GigaMapConfig;
use proptest::prelude::*;

/// Strategy for picking one of the fixture cities.
pub fn city_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(CITIES.to_vec()).prop_map(str::to_string)
}

/// Strategy for a subset of the fixture tags.
pub fn tags_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::sample::subsequence(TAGS.to_vec(), 0..=TAGS.len())
        .prop_map(|tags| tags.into_iter().map(str::to_string).collect())
}

/// Strategy for a birth date as `yyyymmdd`, with few distinct years so
/// composite queries hit shared components.
pub fn birth_date_strategy() -> impl Strategy<Value = u32> {
    (1990u32..1995, 1u32..=12, 1u32..=28).prop_map(|(y, m, d)| y * 10_000 + m * 100 + d)
}

/// Strategy for customer numbers, including the zero that binary indices
/// store under a sentinel bit.
pub fn customer_no_strategy() -> impl Strategy<Value = u64> {
    prop_oneof![
        Just(0u64),
        0u64..64,
        (u64::MAX / 2)..(u64::MAX - 1),
    ]
}

/// Strategy for arbitrary people.
pub fn person_strategy() -> impl Strategy<Value = Person> {
    (
        customer_no_strategy(),
        prop::string::string_regex("[a-z]{1,6}").expect("Invalid regex"),
        city_strategy(),
        0u32..100,
        birth_date_strategy(),
        any::<bool>(),
        tags_strategy(),
    )
        .prop_map(|(customer_no, name, city, age, born, active, tags)| Person {
            customer_no,
            name,
            city,
            age,
            born,
            active,
            tags,
        })
}

/// Strategy for a list of people.
pub fn people_strategy(max: usize) -> impl Strategy<Value = Vec<Person>> {
    prop::collection::vec(person_strategy(), 0..max)
}

/// A mutation applied to a map under test.
///
/// Positions refer to the entities added so far, wrapping around.
#[derive(Debug, Clone)]
pub enum MapOp {
    /// Adds a person.
    Add(Person),
    /// Replaces the entity at a position.
    Replace(usize, Person),
    /// Removes the entity at a position.
    Remove(usize),
}

/// Strategy for one map operation, biased towards adds.
pub fn map_op_strategy() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        3 => person_strategy().prop_map(MapOp::Add),
        2 => (any::<usize>(), person_strategy()).prop_map(|(at, p)| MapOp::Replace(at, p)),
        1 => any::<usize>().prop_map(MapOp::Remove),
    ]
}

/// Strategy for a sequence of map operations.
pub fn map_ops_strategy(max: usize) -> impl Strategy<Value = Vec<MapOp>> {
    prop::collection::vec(map_op_strategy(), 1..max)
}

/// Strategy for small valid geometries.
pub fn config_strategy() -> impl Strategy<Value = GigaMapConfig> {
    (1u32..=4, 1u32..=4, 0u32..=4, any::<bool>()).prop_map(|(l1, l2, block, compress)| {
        GigaMapConfig::default()
            .level1_exponent(l1)
            .level2_exponent(l2)
            .level3_exponents(0, 20)
            .bitmap_block_exponent(block)
            .compress_on_store(compress)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_people_have_valid_dates(person in person_strategy()) {
            let (year, month, day) = person.birth_date();
            prop_assert!((1990..1995).contains(&year));
            prop_assert!((1..=12).contains(&month));
            prop_assert!((1..=28).contains(&day));
        }

        #[test]
        fn generated_tags_are_distinct(tags in tags_strategy()) {
            let mut sorted = tags.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), tags.len());
        }

        #[test]
        fn generated_configs_validate(config in config_strategy()) {
            prop_assert!(config.validate().is_ok());
        }
    }
}

//! Cross-checking harness.
//!
//! Applies every mutation both to a map and to a plain shadow collection,
//! then compares the answers of each fixture index against a linear scan of
//! the shadow.

use crate::fixtures::{Person, TestMap, CITIES, TAGS};
use crate::generators::MapOp;
use gigamap_core::{Condition, CoreError, CoreResult, EntityId, GigaMapConfig};
use std::collections::{BTreeMap, BTreeSet};

/// A test harness for integration testing.
pub struct IntegrationHarness {
    /// The map under test.
    pub map: TestMap,
    /// Every ID ever assigned, in assignment order.
    added: Vec<EntityId>,
    /// Entities that should currently be live.
    live: BTreeMap<EntityId, Person>,
    unique_customer_no: bool,
}

impl IntegrationHarness {
    /// Creates a harness over a map with the default geometry.
    pub fn new() -> Self {
        Self::with_map(TestMap::new())
    }

    /// Creates a harness over a map with the given geometry.
    pub fn with_config(config: GigaMapConfig) -> Self {
        Self::with_map(TestMap::with_config(config))
    }

    fn with_map(map: TestMap) -> Self {
        Self {
            map,
            added: Vec::new(),
            live: BTreeMap::new(),
            unique_customer_no: false,
        }
    }

    /// Makes the customer number unique on both sides.
    pub fn with_unique_customer_no(mut self) -> Self {
        self.map = self.map.with_unique_customer_no();
        self.unique_customer_no = true;
        self
    }

    fn taken_by_other(&self, customer_no: u64, except: Option<EntityId>) -> bool {
        self.unique_customer_no
            && self
                .live
                .iter()
                .any(|(id, p)| Some(*id) != except && p.customer_no == customer_no)
    }

    /// Adds a person, asserting the map accepts exactly what the shadow
    /// expects it to accept.
    pub fn add(&mut self, person: Person) -> CoreResult<EntityId> {
        let expect_violation = self.taken_by_other(person.customer_no, None);
        let result = self.map.add(person.clone());
        match &result {
            Ok(id) => {
                assert!(!expect_violation, "duplicate customer number accepted");
                self.added.push(*id);
                self.live.insert(*id, person);
            }
            Err(err) => assert!(
                expect_violation && matches!(err, CoreError::ConstraintViolation { .. }),
                "unexpected add failure: {err}"
            ),
        }
        result
    }

    /// Replaces the entity at position `at` of the assigned IDs.
    pub fn replace(&mut self, at: usize, person: Person) -> Option<CoreResult<()>> {
        let id = *self.added.get(at % self.added.len().max(1))?;
        let result = self.map.replace(id, person.clone()).map(|_| ());
        if !self.live.contains_key(&id) {
            assert!(
                matches!(result, Err(CoreError::EntityNotFound { .. })),
                "replacing removed entity {id} did not fail"
            );
            return Some(result);
        }
        let expect_violation = self.taken_by_other(person.customer_no, Some(id));
        match &result {
            Ok(()) => {
                assert!(!expect_violation, "duplicate customer number accepted");
                self.live.insert(id, person);
            }
            Err(err) => assert!(
                expect_violation && matches!(err, CoreError::ConstraintViolation { .. }),
                "unexpected replace failure: {err}"
            ),
        }
        Some(result)
    }

    /// Removes the entity at position `at` of the assigned IDs.
    pub fn remove(&mut self, at: usize) -> Option<EntityId> {
        let id = *self.added.get(at % self.added.len().max(1))?;
        let removed = self.map.remove(id).expect("Failed to remove entity");
        let expected = self.live.remove(&id);
        assert_eq!(removed.map(|p| (*p).clone()), expected, "removed entity mismatch for {id}");
        Some(id)
    }

    /// Applies one generated operation. Constraint rejections are expected
    /// outcomes and are not reported.
    pub fn apply(&mut self, op: &MapOp) {
        match op {
            MapOp::Add(person) => {
                let _ = self.add(person.clone());
            }
            MapOp::Replace(at, person) => {
                let _ = self.replace(*at, person.clone());
            }
            MapOp::Remove(at) => {
                self.remove(*at);
            }
        }
    }

    /// Entities the shadow holds.
    pub fn tracked_count(&self) -> usize {
        self.live.len()
    }

    fn expected(&self, matches: impl Fn(&Person) -> bool) -> Vec<EntityId> {
        self.live
            .iter()
            .filter(|(_, p)| matches(p))
            .map(|(id, _)| *id)
            .collect()
    }

    fn check(&self, what: &str, condition: Condition<Person>, matches: impl Fn(&Person) -> bool) {
        let query = self.map.query(condition);
        let actual = query.ids().expect("Failed to run query");
        let expected = self.expected(matches);
        assert_eq!(actual, expected, "query mismatch for {what}");
        assert_eq!(
            query.count().expect("Failed to count"),
            expected.len() as u64,
            "count mismatch for {what}"
        );
    }

    /// Verifies every tracked entity and every fixture index.
    pub fn verify_all(&self) {
        assert_eq!(self.map.size(), self.live.len() as u64, "size mismatch");
        for id in &self.added {
            let actual = self.map.get(*id).expect("Failed to get entity");
            assert_eq!(
                actual.as_deref(),
                self.live.get(id),
                "entity mismatch for {id}"
            );
        }

        let idx = &self.map.indices;
        self.check("all", Condition::all(), |_| true);

        for city in CITIES {
            self.check(city, idx.city.is(city.to_string()), |p| p.city == city);
            self.check(
                &format!("not {city}"),
                !idx.city.is(city.to_string()),
                |p| p.city != city,
            );
        }
        for tag in TAGS {
            self.check(tag, idx.tag.is(tag.to_string()), |p| {
                p.tags.iter().any(|t| t == tag)
            });
        }
        self.check("active", idx.active.is_true(), |p| p.active);
        self.check("inactive", idx.active.is_false(), |p| !p.active);

        let ages: BTreeSet<u32> = self.live.values().map(|p| p.age).collect();
        for age in ages {
            self.check(&format!("age {age}"), idx.age.is(age), |p| p.age == age);
        }
        let numbers: BTreeSet<u64> = self.live.values().map(|p| p.customer_no).collect();
        for no in numbers {
            self.check(&format!("customer {no}"), idx.customer_no.is(no), |p| {
                p.customer_no == no
            });
        }
        let names: BTreeSet<String> = self.live.values().map(|p| p.name.clone()).collect();
        for name in names {
            self.check(&format!("name {name}"), idx.name.is(name.clone()), |p| {
                p.name == name
            });
        }

        let dates: BTreeSet<(u32, u32, u32)> = self.live.values().map(Person::birth_date).collect();
        for (year, month, day) in dates {
            self.check(
                &format!("born {year}"),
                idx.born.is([Some(year), None, None]),
                |p| p.birth_date().0 == year,
            );
            self.check(
                &format!("born {year}-{month}-{day}"),
                idx.born.is([Some(year), Some(month), Some(day)]),
                |p| p.birth_date() == (year, month, day),
            );
            self.check(
                &format!("active and born {year} or in Arusha"),
                (idx.active.is_true() & idx.born.is([Some(year), None, None]))
                    | idx.city.is("Arusha".to_string()),
                |p| (p.active && p.birth_date().0 == year) || p.city == "Arusha",
            );
        }
    }
}

impl Default for IntegrationHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::scenarios;

    #[test]
    fn harness_tracks_adds_and_removes() {
        let mut harness = IntegrationHarness::with_config(GigaMapConfig::compact());
        for person in scenarios::sample_people(40) {
            harness.add(person).unwrap();
        }
        harness.remove(3);
        harness.remove(17);
        assert_eq!(harness.tracked_count(), 38);
        harness.verify_all();
    }

    #[test]
    fn harness_expects_unique_rejections() {
        let mut harness = IntegrationHarness::new().with_unique_customer_no();
        harness.add(scenarios::person(1)).unwrap();
        harness.add(scenarios::person(2)).unwrap();
        assert!(harness.add(scenarios::person(1)).is_err());
        assert!(harness.replace(1, scenarios::person(1)).unwrap().is_err());
        harness.verify_all();
    }

    #[test]
    fn replacing_a_removed_entity_fails() {
        let mut harness = IntegrationHarness::new();
        harness.add(scenarios::person(5)).unwrap();
        harness.remove(0);
        assert!(harness.replace(0, scenarios::person(6)).unwrap().is_err());
        harness.verify_all();
    }
}

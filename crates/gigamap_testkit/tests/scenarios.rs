//! End-to-end scenarios across the storage and core crates.

use gigamap_core::{
    BinaryFn, BitmapLevel3, BitmapOwner, ChangeSet, ConstraintFn, CoreError, EntityId, GigaMap,
    GigaMapConfig, IndexId, InMemorySegmentStore, IterationThreadProvider, SegmentStore,
    ThreadCountStrategy,
};
use gigamap_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::Arc;

#[test]
fn unique_violation_on_replace_leaves_everything_unchanged() {
    init_tracing();
    let map: GigaMap<u32> = GigaMap::new();
    let value = map
        .add_binary_index(BinaryFn::new("value", |v: &u32| Some(*v)))
        .unwrap();
    map.add_unique_constraint(&value).unwrap();

    let one = map.add(1).unwrap();
    let two = map.add(2).unwrap();
    let three = map.add(3).unwrap();

    let err = map.replace(two, 3).unwrap_err();
    assert!(matches!(err, CoreError::ConstraintViolation { entity_id, .. } if entity_id == two));

    assert_eq!(map.size(), 3);
    assert_eq!(*map.get(two).unwrap().unwrap(), 2);
    assert_eq!(map.query(value.is(2)).ids().unwrap(), vec![two]);
    assert_eq!(map.query(value.is(3)).ids().unwrap(), vec![three]);
    assert_eq!(map.query(value.is(1)).ids().unwrap(), vec![one]);
    assert_eq!(map.stats().constraint_violations(), 1);
}

#[test]
fn rejected_replace_returns_both_entities() {
    let map = TestMap::compact().with_unique_customer_no();
    let ada = map.add(Person::new(1, "ada", "Moshi", 36)).unwrap();
    map.add(Person::new(2, "bob", "Tanga", 41)).unwrap();

    let err = map.replace(ada, Person::new(2, "ada", "Arusha", 37)).unwrap_err();
    assert_eq!(err.offending_entity::<Person>().unwrap().city, "Arusha");
    assert_eq!(err.replaced_entity::<Person>().unwrap().city, "Moshi");
    assert_eq!(map.get(ada).unwrap().unwrap().city, "Moshi");

    let err = map.add(Person::new(1, "eve", "Dodoma", 22)).unwrap_err();
    assert_eq!(err.offending_entity::<Person>().unwrap().name, "eve");
    assert!(err.replaced_entity::<Person>().is_none());
    assert_eq!(map.size(), 2);
}

#[test]
fn add_all_stays_contiguous_while_another_thread_adds() {
    const BATCH: u64 = 200_000;
    let map: GigaMap<u64> = GigaMap::new();
    let value = map
        .add_binary_index(BinaryFn::new("value", |v: &u64| Some(*v)))
        .unwrap();
    let writer = map.clone();

    let first = std::thread::scope(|scope| {
        scope.spawn(move || {
            for i in 0..BATCH {
                writer.add(1_000_000 + i).unwrap();
            }
        });
        map.add_all(0..BATCH).unwrap().unwrap()
    });

    assert_eq!(map.size(), 2 * BATCH);
    let misplaced = (0..BATCH)
        .filter(|i| map.get(EntityId::new(first.as_u64() + i)).unwrap().as_deref() != Some(i))
        .count();
    assert_eq!(misplaced, 0);
    assert_eq!(
        map.query(value.is(BATCH - 1)).ids().unwrap(),
        vec![EntityId::new(first.as_u64() + BATCH - 1)]
    );
}

#[test]
fn point_query_over_a_million_entities() {
    let map: GigaMap<u64> = GigaMap::new();
    let value = map
        .add_binary_index(BinaryFn::new("value", |v: &u64| Some(*v)))
        .unwrap();

    let first = map.add_all(0..1_000_000u64).unwrap();
    assert_eq!(first, Some(EntityId::new(0)));
    assert_eq!(map.size(), 1_000_000);

    for k in [0u64, 1, 16_383, 16_384, 523_777, 999_999] {
        let query = map.query(value.is(k));
        assert_eq!(query.ids().unwrap(), vec![EntityId::new(k)]);
        assert_eq!(*query.first().unwrap().unwrap().1, k);
    }
    assert!(!map.query(value.is(1_000_000)).exists().unwrap());
}

#[test]
fn composite_sample_matches_all_given_components() {
    let map = TestMap::new();
    let people = [
        Person::new(1, "a", "Moshi", 30),
        Person::new(2, "b", "Moshi", 30),
        Person::new(3, "c", "Tanga", 31),
    ];
    let mut born = people.clone();
    born[0].born = 19940214;
    born[1].born = 19940315;
    born[2].born = 19940214;
    let ids: Vec<_> = born.iter().map(|p| map.add(p.clone()).unwrap()).collect();

    let exact = map.query(map.indices.born.is([Some(1994), Some(2), Some(14)]));
    assert_eq!(exact.ids().unwrap(), vec![ids[0], ids[2]]);

    let year_only = map.query(map.indices.born.is([Some(1994), None, None]));
    assert_eq!(year_only.ids().unwrap(), ids);

    let month_and_day = map.query(map.indices.born.is([None, Some(3), Some(15)]));
    assert_eq!(month_and_day.ids().unwrap(), vec![ids[1]]);

    let combined = map.query(
        map.indices.born.is([Some(1994), Some(2), None]) & map.indices.city.is("Tanga".into()),
    );
    assert_eq!(combined.ids().unwrap(), vec![ids[2]]);
}

#[test]
fn small_binary_keys_keep_zero_apart_from_max() {
    let map: GigaMap<u8> = GigaMap::new();
    let byte = map
        .add_binary_index(BinaryFn::new("byte", |v: &u8| Some(*v)))
        .unwrap();
    let zero = map.add(0).unwrap();
    let max = map.add(u8::MAX).unwrap();

    assert_eq!(map.query(byte.is(0)).ids().unwrap(), vec![zero]);
    assert_eq!(map.query(byte.is(u8::MAX)).ids().unwrap(), vec![max]);
}

#[test]
fn long_keys_reject_max_and_accept_zero() {
    let map: GigaMap<i64> = GigaMap::new();
    let key = map
        .add_binary_index(BinaryFn::new("key", |v: &i64| Some(*v)))
        .unwrap();
    let zero = map.add(0).unwrap();
    let minus = map.add(-1).unwrap();

    assert!(matches!(
        map.add(i64::MAX),
        Err(CoreError::InvalidConfiguration { .. })
    ));
    assert_eq!(map.size(), 2);
    assert_eq!(map.query(key.is(0)).ids().unwrap(), vec![zero]);
    assert_eq!(map.query(key.is(-1)).ids().unwrap(), vec![minus]);
}

#[test]
fn null_keys_are_rejected_when_forbidden() {
    let map: GigaMap<Option<u32>> = GigaMap::new();
    map.add_binary_index(BinaryFn::new("maybe", |v: &Option<u32>| *v).forbid_null())
        .unwrap();
    map.add(Some(4)).unwrap();
    assert!(map.add(None).is_err());
    assert_eq!(map.size(), 1);
}

#[test]
fn custom_constraint_blocks_adds_and_replaces() {
    let map = TestMap::new();
    map.add_custom_constraint(ConstraintFn::new(
        "adults only",
        |_id: EntityId, _old: Option<&Person>, p: &Person| {
            if p.age >= 18 {
                Ok(())
            } else {
                Err(format!("{} is {}", p.name, p.age))
            }
        },
    ))
    .unwrap();

    let id = map.add(Person::new(1, "ada", "Moshi", 36)).unwrap();
    assert!(map.add(Person::new(2, "kid", "Moshi", 9)).is_err());
    assert!(map.replace(id, Person::new(1, "ada", "Moshi", 9)).is_err());
    assert!(!map.check_add(&Person::new(3, "teen", "Moshi", 15)).unwrap());
    assert!(map.check_add(&Person::new(3, "adult", "Moshi", 25)).unwrap());

    assert_eq!(map.size(), 1);
    assert_eq!(map.query(map.indices.age.is(36)).ids().unwrap(), vec![id]);
    assert!(!map.query(map.indices.age.is(9)).exists().unwrap());
}

#[test]
fn compressed_store_round_trips_through_a_file() {
    init_tracing();
    let store = TestSegmentStore::new();
    let map = TestMap::with_config(GigaMapConfig::compact().compress_on_store(true));
    scenarios::populate(&map, 500);

    let before: Vec<_> = CITIES
        .iter()
        .map(|c| map.query(map.indices.city.is((*c).to_string())).ids().unwrap())
        .collect();

    let report = map.store_to(store.store.as_ref()).unwrap();
    assert!(report.segments_written() > 0);
    assert!(map.dirty_nodes().is_empty());

    let evicted = map.evict_unused(store.shared()).unwrap();
    assert!(evicted > 0);

    let after: Vec<_> = CITIES
        .iter()
        .map(|c| map.query(map.indices.city.is((*c).to_string())).ids().unwrap())
        .collect();
    assert_eq!(before, after);
    assert_eq!(*map.get(EntityId::new(321)).unwrap().unwrap(), scenarios::person(321));
    assert!(map.stats().segments_loaded() > 0);

    let reopened = store.reopen();
    assert_eq!(reopened.segment_count(), store.store.segment_count());
}

#[test]
fn changes_after_a_store_are_written_incrementally() {
    let store = InMemorySegmentStore::new();
    let map = TestMap::compact();
    scenarios::populate(&map, 64);

    let first = map.store_to(&store).unwrap();
    assert_eq!(map.store_to(&store).unwrap().segments_written(), 0);

    map.replace(EntityId::new(5), scenarios::person(1_005)).unwrap();
    let second = map.store_to(&store).unwrap();
    assert!(second.segments_written() > 0);
    assert!(second.segments_written() < first.segments_written());
}

#[test]
fn parallel_iteration_matches_sequential() {
    let map = TestMap::compact();
    scenarios::populate(&map, 5_000);
    let condition = || map.indices.active.is_true() & !map.indices.city.is("Dodoma".into());

    let sequential = map.query(condition()).to_vec().unwrap();
    for provider in [
        IterationThreadProvider::NoParallelism,
        IterationThreadProvider::Transient(ThreadCountStrategy::Fixed(4)),
        IterationThreadProvider::pooled(ThreadCountStrategy::adaptive()).unwrap(),
    ] {
        let parallel = map.query(condition()).to_vec_with(&provider).unwrap();
        assert_eq!(parallel, sequential);
    }
}

#[test]
fn harness_survives_a_long_mixed_workload() {
    let mut harness = IntegrationHarness::with_config(GigaMapConfig::compact()).with_unique_customer_no();
    for i in 0..300u64 {
        let _ = harness.add(scenarios::person(i % 250));
        if i % 7 == 0 {
            harness.remove(i as usize * 13);
        }
        if i % 5 == 0 {
            let _ = harness.replace(i as usize * 3, scenarios::person(i + 1_000));
        }
    }
    harness.verify_all();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn indices_follow_random_workloads(config in config_strategy(), ops in map_ops_strategy(60)) {
        let mut harness = IntegrationHarness::with_config(config).with_unique_customer_no();
        for op in &ops {
            harness.apply(op);
        }
        harness.verify_all();
    }

    #[test]
    fn exactly_one_boolean_side_holds_each_entity(people in people_strategy(40)) {
        let map = TestMap::compact();
        let ids: Vec<_> = people.iter().map(|p| map.add(p.clone()).unwrap()).collect();
        let reader = map.read();
        let yes = reader.evaluate(&map.indices.active.is_true()).unwrap();
        let no = reader.evaluate(&map.indices.active.is_false()).unwrap();
        for id in ids {
            prop_assert!(yes.contains(id).unwrap() != no.contains(id).unwrap());
        }
    }

    #[test]
    fn compression_keeps_every_bit(ids in prop::collection::btree_set(0u64..200_000, 0..300), samples in prop::collection::vec(0u64..200_000, 50)) {
        let mut bits = BitmapLevel3::new(6);
        let mut changes = ChangeSet::new();
        let owner = BitmapOwner::new(IndexId::new(0), 0, 0);
        for id in &ids {
            bits.add(*id, owner, &mut changes).unwrap();
        }
        let before: Vec<bool> = samples.iter().map(|id| bits.contains(*id).unwrap()).collect();
        bits.ensure_compressed().unwrap();
        let compressed: Vec<bool> = samples.iter().map(|id| bits.contains(*id).unwrap()).collect();
        bits.ensure_decompressed().unwrap();
        let after: Vec<bool> = samples.iter().map(|id| bits.contains(*id).unwrap()).collect();
        prop_assert_eq!(&before, &compressed);
        prop_assert_eq!(&before, &after);
        prop_assert_eq!(bits.bit_count().unwrap(), ids.len() as u64);
    }

    #[test]
    fn evicted_maps_answer_like_resident_ones(people in people_strategy(50)) {
        let store: Arc<dyn SegmentStore> = Arc::new(InMemorySegmentStore::new());
        let map = TestMap::compact();
        for person in &people {
            map.add(person.clone()).unwrap();
        }
        let expected = map.query(map.indices.active.is_true()).to_vec().unwrap();
        map.store_to(store.as_ref()).unwrap();
        map.evict_unused(Arc::clone(&store)).unwrap();
        prop_assert_eq!(map.query(map.indices.active.is_true()).to_vec().unwrap(), expected);
    }
}

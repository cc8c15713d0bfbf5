//! Test fixtures and map helpers.
//!
//! Provides a sample entity with one indexer of every kind, maps that come
//! with those indices registered, and segment stores with automatic cleanup.

use gigamap_core::{
    BinaryIndex, BinaryIndexer, BooleanIndex, BooleanIndexer, CborCodec,
    CompositeIndex, CompositeIndexer, CoreResult, EntityCodec, FileSegmentStore, GigaMap,
    GigaMapConfig, HashingIndex, HashingIndexer, IndexHandle, SegmentStore, SubKind,
};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Cities the fixtures draw from.
pub const CITIES: [&str; 8] = [
    "Arusha", "Dodoma", "Mwanza", "Mbeya", "Tanga", "Moshi", "Tabora", "Iringa",
];

/// Tags the fixtures draw from.
pub const TAGS: [&str; 5] = ["premium", "newsletter", "beta", "staff", "partner"];

/// A sample entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    /// Customer number, unique when the fixture constraint is registered.
    pub customer_no: u64,
    /// Full name.
    pub name: String,
    /// Home city.
    pub city: String,
    /// Age in years.
    pub age: u32,
    /// Birth date as `yyyymmdd`.
    pub born: u32,
    /// Whether the account is active.
    pub active: bool,
    /// Free-form tags; indexed one key per tag.
    pub tags: Vec<String>,
}

impl Person {
    /// Creates a person with derived fields filled from `customer_no`.
    pub fn new(customer_no: u64, name: impl Into<String>, city: impl Into<String>, age: u32) -> Self {
        let year = 2024 - age;
        let month = (customer_no % 12) as u32 + 1;
        let day = (customer_no % 28) as u32 + 1;
        Self {
            customer_no,
            name: name.into(),
            city: city.into(),
            age,
            born: year * 10_000 + month * 100 + day,
            active: customer_no % 3 != 0,
            tags: Vec::new(),
        }
    }

    /// Sets the tags.
    #[must_use]
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| (*t).to_string()).collect();
        self
    }

    /// Sets the active flag.
    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Birth year, month and day.
    pub fn birth_date(&self) -> (u32, u32, u32) {
        (self.born / 10_000, self.born / 100 % 100, self.born % 100)
    }
}

impl EntityCodec for Person {
    fn encode_entity(&self) -> CoreResult<Vec<u8>> {
        CborCodec::encode(self)
    }

    fn decode_entity(bytes: &[u8]) -> CoreResult<Self> {
        CborCodec::decode(bytes)
    }
}

/// Hashing index on the name.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByName;

impl HashingIndexer<Person> for ByName {
    type Key = String;

    fn name(&self) -> String {
        "name".into()
    }

    fn index(&self, entity: &Person) -> String {
        entity.name.clone()
    }
}

/// Hashing index on the city.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByCity;

impl HashingIndexer<Person> for ByCity {
    type Key = String;

    fn name(&self) -> String {
        "city".into()
    }

    fn index(&self, entity: &Person) -> String {
        entity.city.clone()
    }
}

/// Multi-value hashing index on the tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByTag;

impl HashingIndexer<Person> for ByTag {
    type Key = String;

    fn name(&self) -> String {
        "tag".into()
    }

    fn index(&self, entity: &Person) -> String {
        entity.tags.first().cloned().unwrap_or_default()
    }

    fn index_multi(&self, entity: &Person, keys: &mut Vec<String>) {
        keys.extend(entity.tags.iter().cloned());
    }
}

/// Binary index on the age.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByAge;

impl BinaryIndexer<Person> for ByAge {
    type Value = u32;

    fn name(&self) -> String {
        "age".into()
    }

    fn index(&self, entity: &Person) -> Option<u32> {
        Some(entity.age)
    }
}

/// Binary index on the customer number. Null keys are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByCustomerNo;

impl BinaryIndexer<Person> for ByCustomerNo {
    type Value = u64;

    fn name(&self) -> String {
        "customer_no".into()
    }

    fn index(&self, entity: &Person) -> Option<u64> {
        Some(entity.customer_no)
    }

    fn allows_null(&self) -> bool {
        false
    }
}

/// Composite index on the birth date: year, month, day.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByBirthDate;

impl CompositeIndexer<Person> for ByBirthDate {
    type Component = u32;

    fn name(&self) -> String {
        "born".into()
    }

    fn max_width(&self) -> usize {
        3
    }

    fn sub_kind(&self) -> SubKind {
        SubKind::Binary
    }

    fn index(&self, entity: &Person, carrier: &mut Vec<Option<u32>>) {
        let (year, month, day) = entity.birth_date();
        carrier.extend([Some(year), Some(month), Some(day)]);
    }

    fn to_binary(&self, component: &u32) -> CoreResult<u64> {
        Ok(u64::from(*component))
    }
}

/// Boolean index on the active flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsActive;

impl BooleanIndexer<Person> for IsActive {
    fn name(&self) -> String {
        "active".into()
    }

    fn index(&self, entity: &Person) -> bool {
        entity.active
    }
}

/// Handles of the fixture indices.
#[derive(Debug, Clone)]
pub struct PersonIndices {
    /// Name index.
    pub name: IndexHandle<HashingIndex<Person, ByName>>,
    /// City index.
    pub city: IndexHandle<HashingIndex<Person, ByCity>>,
    /// Tag index.
    pub tag: IndexHandle<HashingIndex<Person, ByTag>>,
    /// Age index.
    pub age: IndexHandle<BinaryIndex<Person, ByAge>>,
    /// Customer number index.
    pub customer_no: IndexHandle<BinaryIndex<Person, ByCustomerNo>>,
    /// Birth date index.
    pub born: IndexHandle<CompositeIndex<Person, ByBirthDate>>,
    /// Active flag index.
    pub active: IndexHandle<BooleanIndex<Person, IsActive>>,
}

impl PersonIndices {
    /// Registers every fixture index on `map`.
    ///
    /// # Errors
    ///
    /// Propagates registration failures.
    pub fn register(map: &GigaMap<Person>) -> CoreResult<Self> {
        Ok(Self {
            name: map.add_hashing_index(ByName)?,
            city: map.add_hashing_index(ByCity)?,
            tag: map.add_hashing_index(ByTag)?,
            age: map.add_binary_index(ByAge)?,
            customer_no: map.add_binary_index(ByCustomerNo)?,
            born: map.add_composite_index(ByBirthDate)?,
            active: map.add_boolean_index(IsActive)?,
        })
    }
}

/// A map of [`Person`] with every fixture index registered.
pub struct TestMap {
    /// The map.
    pub map: GigaMap<Person>,
    /// The registered indices.
    pub indices: PersonIndices,
}

impl TestMap {
    /// Creates a map with the default geometry.
    pub fn new() -> Self {
        Self::with_config(GigaMapConfig::default())
    }

    /// Creates a map with tiny segments, so small tests cross many
    /// segment boundaries.
    pub fn compact() -> Self {
        Self::with_config(GigaMapConfig::compact())
    }

    /// Creates a map with the given geometry.
    pub fn with_config(config: GigaMapConfig) -> Self {
        let map = GigaMap::with_config(config).expect("Invalid map configuration");
        let indices = PersonIndices::register(&map).expect("Failed to register indices");
        Self { map, indices }
    }

    /// Makes the customer number unique.
    pub fn with_unique_customer_no(self) -> Self {
        self.map
            .add_unique_constraint(&self.indices.customer_no)
            .expect("Failed to add unique constraint");
        self
    }
}

impl Default for TestMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TestMap {
    type Target = GigaMap<Person>;

    fn deref(&self) -> &Self::Target {
        &self.map
    }
}

/// A file-backed segment store in a temporary directory.
pub struct TestSegmentStore {
    /// The store.
    pub store: Arc<FileSegmentStore>,
    path: PathBuf,
    _temp_dir: TempDir,
}

impl TestSegmentStore {
    /// Creates an empty store file.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("segments").join("map.seg");
        let store =
            FileSegmentStore::open_with_create_dirs(&path).expect("Failed to open segment store");
        Self {
            store: Arc::new(store),
            path,
            _temp_dir: temp_dir,
        }
    }

    /// The store as a trait object, as the persistence cycle takes it.
    pub fn shared(&self) -> Arc<dyn SegmentStore> {
        Arc::clone(&self.store) as Arc<dyn SegmentStore>
    }

    /// Opens the same file again, as a process restart would.
    pub fn reopen(&self) -> FileSegmentStore {
        FileSegmentStore::open(&self.path).expect("Failed to reopen segment store")
    }

    /// Path of the store file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Default for TestSegmentStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a test against a fresh [`TestMap`].
pub fn with_test_map<F, R>(f: F) -> R
where
    F: FnOnce(&TestMap) -> R,
{
    let map = TestMap::new();
    f(&map)
}

/// Common data sets.
pub mod scenarios {
    use super::*;

    /// The `i`-th person of the deterministic sample population.
    pub fn person(i: u64) -> Person {
        let city = CITIES[(i % CITIES.len() as u64) as usize];
        let age = 18 + (i % 60) as u32;
        let tags: Vec<&str> = TAGS
            .iter()
            .enumerate()
            .filter(|(t, _)| (i >> t) & 1 == 1)
            .map(|(_, tag)| *tag)
            .collect();
        Person::new(i, format!("person-{i}"), city, age).with_tags(&tags)
    }

    /// `count` sample people with customer numbers `0..count`.
    pub fn sample_people(count: u64) -> Vec<Person> {
        (0..count).map(person).collect()
    }

    /// Adds `count` sample people.
    pub fn populate(map: &GigaMap<Person>, count: u64) {
        map.add_all(sample_people(count))
            .expect("Failed to populate map");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_registers_every_index() {
        let map = TestMap::new();
        let mut names = map.index_names();
        names.sort();
        assert_eq!(
            names,
            vec!["active", "age", "born", "city", "customer_no", "name", "tag"]
        );
    }

    #[test]
    fn birth_date_splits_into_components() {
        let person = Person::new(13, "x", "Moshi", 30);
        assert_eq!(person.birth_date(), (1994, 2, 14));
    }

    #[test]
    fn person_round_trips_through_cbor() {
        let person = scenarios::person(21);
        let bytes = person.encode_entity().unwrap();
        assert_eq!(Person::decode_entity(&bytes).unwrap(), person);
    }

    #[test]
    fn populate_adds_everyone() {
        with_test_map(|map| {
            scenarios::populate(map, 50);
            assert_eq!(map.size(), 50);
        });
    }

    #[test]
    fn segment_store_survives_reopen() {
        let store = TestSegmentStore::new();
        let handle = store.store.allocate();
        store.store.write(handle, b"payload").unwrap();
        store.store.flush().unwrap();
        assert_eq!(store.reopen().read(handle).unwrap(), b"payload");
    }
}

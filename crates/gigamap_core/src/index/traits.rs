//! Indexer traits: how keys are extracted from entities.
//!
//! An indexer is a pure function from entity to key with a name that is
//! unique among the indices of one map. Key equality is the key type's
//! `Eq`/`Hash`; wrap keys in a newtype to index under a different equality.

use crate::error::{CoreError, CoreResult};
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;

/// The kind of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// One bitmap per distinct key, found through a hash table.
    Hashing,
    /// One bitmap per key bit; keys are integers.
    Binary,
    /// One sub-index per key component.
    Composite,
    /// One bitmap for `true`; `false` is its negation.
    Boolean,
}

/// Flavor of the sub-indices of a composite index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubKind {
    /// Components are looked up by equality.
    Hashing,
    /// Components are converted to integer keys.
    Binary,
}

/// Default indexer name: the unqualified type name.
pub(crate) fn default_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Extracts a hashable key.
pub trait HashingIndexer<E>: Send + Sync + 'static {
    /// The key type.
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    /// Name of the index, unique within a map.
    fn name(&self) -> String {
        default_name::<Self>()
    }

    /// Extracts the key of an entity.
    fn index(&self, entity: &E) -> Self::Key;

    /// Extracts every key of a multi-value entity.
    ///
    /// The default indexes the single key returned by [`Self::index`].
    fn index_multi(&self, entity: &E, keys: &mut Vec<Self::Key>) {
        keys.push(self.index(entity));
    }
}

/// An integer that can be stored as a bit-addressed key.
///
/// Zero is never a valid bit key, so every type maps its zero to a sentinel
/// outside the bit range its other values use.
pub trait BinaryValue: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Converts the value to a non-zero 64-bit key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfiguration`] for the value reserved as
    /// the zero sentinel of 64-bit types.
    fn to_key(self) -> CoreResult<u64>;

    /// Converts a key produced by [`Self::to_key`] back.
    fn from_key(key: u64) -> Self;
}

macro_rules! small_binary_value {
    ($($ty:ty => $unsigned:ty),* $(,)?) => {$(
        impl BinaryValue for $ty {
            fn to_key(self) -> CoreResult<u64> {
                const ZERO: u64 = 1u64 << <$unsigned>::BITS;
                match self as $unsigned {
                    0 => Ok(ZERO),
                    bits => Ok(u64::from(bits)),
                }
            }

            fn from_key(key: u64) -> Self {
                const ZERO: u64 = 1u64 << <$unsigned>::BITS;
                if key == ZERO {
                    0
                } else {
                    key as $unsigned as $ty
                }
            }
        }
    )*};
}

small_binary_value!(u8 => u8, i8 => u8, u16 => u16, i16 => u16, u32 => u32, i32 => u32);

impl BinaryValue for u64 {
    fn to_key(self) -> CoreResult<u64> {
        match self {
            0 => Ok(u64::MAX),
            u64::MAX => Err(CoreError::invalid_configuration(
                "u64::MAX is reserved as the zero sentinel and cannot be indexed",
            )),
            value => Ok(value),
        }
    }

    fn from_key(key: u64) -> Self {
        if key == u64::MAX {
            0
        } else {
            key
        }
    }
}

impl BinaryValue for i64 {
    fn to_key(self) -> CoreResult<u64> {
        match self {
            0 => Ok(i64::MAX as u64),
            i64::MAX => Err(CoreError::invalid_configuration(
                "i64::MAX is reserved as the zero sentinel and cannot be indexed",
            )),
            value => Ok(value as u64),
        }
    }

    fn from_key(key: u64) -> Self {
        if key == i64::MAX as u64 {
            0
        } else {
            key as i64
        }
    }
}

/// Extracts an integer key, stored one bitmap per key bit.
///
/// Avoids a hash table entirely, which suits keys with very many distinct
/// values such as identifiers and timestamps.
pub trait BinaryIndexer<E>: Send + Sync + 'static {
    /// The integer type.
    type Value: BinaryValue;

    /// Name of the index, unique within a map.
    fn name(&self) -> String {
        default_name::<Self>()
    }

    /// Extracts the key; `None` is the null key.
    fn index(&self, entity: &E) -> Option<Self::Value>;

    /// Whether entities with a null key may be stored.
    fn allows_null(&self) -> bool {
        true
    }
}

/// Extracts a key made of several components.
///
/// The indexer fills a carrier with one slot per component; `None` slots
/// are skipped. Positions are stable: position `i` is always answered by
/// sub-index `i`.
pub trait CompositeIndexer<E>: Send + Sync + 'static {
    /// The component type.
    type Component: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    /// Name of the index, unique within a map.
    fn name(&self) -> String {
        default_name::<Self>()
    }

    /// Maximum number of components. Wider keys are rejected.
    fn max_width(&self) -> usize;

    /// Flavor of the sub-indices.
    fn sub_kind(&self) -> SubKind {
        SubKind::Hashing
    }

    /// Fills `carrier` with the components of the entity's key.
    fn index(&self, entity: &E, carrier: &mut Vec<Option<Self::Component>>);

    /// Converts a component to an integer for binary sub-indices.
    ///
    /// Zero is a valid result: it is stored under the same sentinel as a
    /// `u64` binary index, so only `u64::MAX` cannot be indexed.
    ///
    /// # Errors
    ///
    /// The default returns [`CoreError::Unsupported`]; binary composite
    /// indexers must override it.
    fn to_binary(&self, component: &Self::Component) -> CoreResult<u64> {
        let _ = component;
        Err(CoreError::unsupported(format!(
            "composite index '{}' does not convert components to binary keys",
            self.name()
        )))
    }
}

/// Extracts a flag.
pub trait BooleanIndexer<E>: Send + Sync + 'static {
    /// Name of the index, unique within a map.
    fn name(&self) -> String {
        default_name::<Self>()
    }

    /// Extracts the flag.
    fn index(&self, entity: &E) -> bool;
}

/// A hashing indexer built from a closure.
pub struct HashingFn<E, K, F> {
    name: String,
    extract: F,
    _marker: PhantomData<fn(&E) -> K>,
}

impl<E, K, F> HashingFn<E, K, F>
where
    F: Fn(&E) -> K,
{
    /// Creates a named hashing indexer.
    pub fn new(name: impl Into<String>, extract: F) -> Self {
        Self {
            name: name.into(),
            extract,
            _marker: PhantomData,
        }
    }
}

impl<E, K, F> HashingIndexer<E> for HashingFn<E, K, F>
where
    E: 'static,
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    F: Fn(&E) -> K + Send + Sync + 'static,
{
    type Key = K;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn index(&self, entity: &E) -> K {
        (self.extract)(entity)
    }
}

/// A binary indexer built from a closure.
pub struct BinaryFn<E, V, F> {
    name: String,
    extract: F,
    allows_null: bool,
    _marker: PhantomData<fn(&E) -> V>,
}

impl<E, V, F> BinaryFn<E, V, F>
where
    F: Fn(&E) -> Option<V>,
{
    /// Creates a named binary indexer that accepts null keys.
    pub fn new(name: impl Into<String>, extract: F) -> Self {
        Self {
            name: name.into(),
            extract,
            allows_null: true,
            _marker: PhantomData,
        }
    }

    /// Rejects entities with a null key.
    #[must_use]
    pub fn forbid_null(mut self) -> Self {
        self.allows_null = false;
        self
    }
}

impl<E, V, F> BinaryIndexer<E> for BinaryFn<E, V, F>
where
    E: 'static,
    V: BinaryValue,
    F: Fn(&E) -> Option<V> + Send + Sync + 'static,
{
    type Value = V;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn index(&self, entity: &E) -> Option<V> {
        (self.extract)(entity)
    }

    fn allows_null(&self) -> bool {
        self.allows_null
    }
}

/// A boolean indexer built from a closure.
pub struct BooleanFn<E, F> {
    name: String,
    extract: F,
    _marker: PhantomData<fn(&E) -> bool>,
}

impl<E, F> BooleanFn<E, F>
where
    F: Fn(&E) -> bool,
{
    /// Creates a named boolean indexer.
    pub fn new(name: impl Into<String>, extract: F) -> Self {
        Self {
            name: name.into(),
            extract,
            _marker: PhantomData,
        }
    }
}

impl<E, F> BooleanIndexer<E> for BooleanFn<E, F>
where
    E: 'static,
    F: Fn(&E) -> bool + Send + Sync + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn index(&self, entity: &E) -> bool {
        (self.extract)(entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_name_strips_path_and_generics() {
        struct ByEmail;
        assert_eq!(default_name::<ByEmail>(), "ByEmail");
        assert_eq!(default_name::<HashingFn<u8, u8, fn(&u8) -> u8>>(), "HashingFn");
    }

    #[test]
    fn small_zero_sentinels_sit_above_the_type_range() {
        assert_eq!(0u8.to_key().unwrap(), 1 << 8);
        assert_eq!(u8::MAX.to_key().unwrap(), 0xFF);
        assert_eq!(0i16.to_key().unwrap(), 1 << 16);
        assert_eq!(0u32.to_key().unwrap(), 1 << 32);
        assert_eq!((-1i32).to_key().unwrap(), u64::from(u32::MAX));
    }

    #[test]
    fn wide_types_reserve_their_max() {
        assert_eq!(0u64.to_key().unwrap(), u64::MAX);
        assert!(u64::MAX.to_key().is_err());
        assert_eq!(0i64.to_key().unwrap(), i64::MAX as u64);
        assert!(i64::MAX.to_key().is_err());
        assert_eq!(i64::from_key((-5i64).to_key().unwrap()), -5);
    }

    #[test]
    fn zero_never_collides_with_max() {
        assert_ne!(0u8.to_key().unwrap(), u8::MAX.to_key().unwrap());
        assert_ne!(0u16.to_key().unwrap(), u16::MAX.to_key().unwrap());
        assert_ne!(0u32.to_key().unwrap(), u32::MAX.to_key().unwrap());
    }

    proptest! {
        #[test]
        fn keys_round_trip_and_are_never_zero(
            a in any::<u8>(),
            b in any::<i16>(),
            c in any::<u32>(),
            d in any::<i32>(),
            e in 0u64..u64::MAX,
            f in i64::MIN..i64::MAX,
        ) {
            prop_assert_eq!(u8::from_key(a.to_key().unwrap()), a);
            prop_assert_eq!(i16::from_key(b.to_key().unwrap()), b);
            prop_assert_eq!(u32::from_key(c.to_key().unwrap()), c);
            prop_assert_eq!(i32::from_key(d.to_key().unwrap()), d);
            prop_assert_eq!(u64::from_key(e.to_key().unwrap()), e);
            prop_assert_eq!(i64::from_key(f.to_key().unwrap()), f);
            for key in [a.to_key(), b.to_key(), c.to_key(), d.to_key(), e.to_key(), f.to_key()] {
                prop_assert_ne!(key.unwrap(), 0);
            }
        }
    }
}

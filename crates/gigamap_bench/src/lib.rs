//! Benchmark utilities.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use gigamap_core::{
    BinaryIndex, BinaryIndexer, BooleanIndex, BooleanIndexer, CoreError, CoreResult, EntityCodec,
    GigaMap, GigaMapConfig, HashingIndex, HashingIndexer, IndexHandle,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Number of distinct regions.
pub const REGIONS: u8 = 16;

/// A small fixed-size entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Order {
    /// Order number, unique.
    pub number: u64,
    /// Customer, about a thousand orders each at 1M orders.
    pub customer: u32,
    /// Region code.
    pub region: u8,
    /// Whether the order has shipped.
    pub shipped: bool,
}

const ORDER_SIZE: usize = 14;

impl EntityCodec for Order {
    fn encode_entity(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(ORDER_SIZE);
        buf.extend_from_slice(&self.number.to_le_bytes());
        buf.extend_from_slice(&self.customer.to_le_bytes());
        buf.push(self.region);
        buf.push(u8::from(self.shipped));
        Ok(buf)
    }

    fn decode_entity(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != ORDER_SIZE {
            return Err(CoreError::codec(format!(
                "order payload must be {ORDER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut number = [0u8; 8];
        number.copy_from_slice(&bytes[0..8]);
        let mut customer = [0u8; 4];
        customer.copy_from_slice(&bytes[8..12]);
        Ok(Self {
            number: u64::from_le_bytes(number),
            customer: u32::from_le_bytes(customer),
            region: bytes[12],
            shipped: bytes[13] != 0,
        })
    }
}

/// Binary index on the order number.
pub struct ByNumber;

impl BinaryIndexer<Order> for ByNumber {
    type Value = u64;

    fn index(&self, entity: &Order) -> Option<u64> {
        Some(entity.number)
    }
}

/// Binary index on the customer.
pub struct ByCustomer;

impl BinaryIndexer<Order> for ByCustomer {
    type Value = u32;

    fn index(&self, entity: &Order) -> Option<u32> {
        Some(entity.customer)
    }
}

/// Hashing index on the region.
pub struct ByRegion;

impl HashingIndexer<Order> for ByRegion {
    type Key = u8;

    fn index(&self, entity: &Order) -> u8 {
        entity.region
    }
}

/// Boolean index on the shipped flag.
pub struct IsShipped;

impl BooleanIndexer<Order> for IsShipped {
    fn index(&self, entity: &Order) -> bool {
        entity.shipped
    }
}

/// A map of orders with every bench index registered.
pub struct OrderMap {
    /// The map.
    pub map: GigaMap<Order>,
    /// Order number index.
    pub number: IndexHandle<BinaryIndex<Order, ByNumber>>,
    /// Customer index.
    pub customer: IndexHandle<BinaryIndex<Order, ByCustomer>>,
    /// Region index.
    pub region: IndexHandle<HashingIndex<Order, ByRegion>>,
    /// Shipped index.
    pub shipped: IndexHandle<BooleanIndex<Order, IsShipped>>,
}

impl OrderMap {
    /// Creates an empty map with the given geometry.
    pub fn new(config: GigaMapConfig) -> Self {
        let map = GigaMap::with_config(config).unwrap();
        Self {
            number: map.add_binary_index(ByNumber).unwrap(),
            customer: map.add_binary_index(ByCustomer).unwrap(),
            region: map.add_hashing_index(ByRegion).unwrap(),
            shipped: map.add_boolean_index(IsShipped).unwrap(),
            map,
        }
    }

    /// Creates a map holding `count` generated orders.
    pub fn populated(config: GigaMapConfig, count: u64) -> Self {
        let orders = Self::new(config);
        orders.map.add_all(generate_orders(count)).unwrap();
        orders
    }
}

/// Generate `count` orders with numbers `0..count` from a fixed seed.
pub fn generate_orders(count: u64) -> Vec<Order> {
    let mut rng = StdRng::seed_from_u64(0x6167_6d61);
    let customers = (count / 1_000).max(1) as u32;
    (0..count)
        .map(|number| Order {
            number,
            customer: rng.gen_range(0..customers),
            region: rng.gen_range(0..REGIONS),
            shipped: rng.gen_bool(0.7),
        })
        .collect()
}

/// Pick a random existing order number.
pub fn random_number(count: u64) -> u64 {
    rand::thread_rng().gen_range(0..count.max(1))
}

/// Installs the log subscriber once, so `RUST_LOG` works for bench runs.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

//! Entities: identifiers, storage, payload encoding.

mod codec;
mod id;
pub(crate) mod store;

pub use codec::{CborCodec, EntityCodec};
pub use id::{EntityAddress, EntityId};
pub use store::EntityStore;

//! Constraints validated between planning and committing a mutation.
//!
//! Unique constraints reuse an index's entry table: a key is unique if its
//! entry holds no entity other than the one being written. Custom
//! constraints run arbitrary checks against the replaced and the new entity.

mod custom;
mod unique;

pub use custom::{ConstraintFn, CustomConstraint, CustomConstraints};
pub use unique::UniqueConstraints;

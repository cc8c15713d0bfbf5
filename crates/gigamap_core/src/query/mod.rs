//! Queries: condition trees, scanning, parallel iteration.

mod condition;
mod scan;
mod threads;

pub use condition::{Condition, ConditionLeaf, QueryContext};
pub use scan::{partition, scan};
pub use threads::{IterationThreadProvider, Task, ThreadCountStrategy, ThreadPool};

//! Vector similarity index.

mod flat;

pub use flat::FlatVectorIndex;

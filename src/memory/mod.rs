//! Address-space model: subregions, entities, and statistics.

pub mod entity;
pub mod stats;
pub mod subregion;

pub use entity::{Entity, EntityKind, ImageMeta};
pub use stats::{BucketCounts, SnapshotStats};
pub use subregion::{
    Subregion, SubregionState, SubregionType, SUBREGION_FLAG_HEAP, SUBREGION_FLAG_STACK,
    SUBREGION_FLAG_TEB,
};

//! The data layer: how an N-dimensional dataset is described (patterns), cut into
//! work (slice plans), stored (backing stores) and accessed chunk by chunk
//! (dataset handles).

//==================================================================================
// 1. Module Declarations
//==================================================================================

pub mod dataset;
pub mod pattern;
pub mod slicing;
pub mod store;

//==================================================================================
// 2. Public API Re-exports
//==================================================================================
pub use self::dataset::{copy_metadata, Backing, Chunk, Dataset};
pub use self::pattern::{AxisRole, Pattern, PatternRegistry};
pub use self::slicing::{plan, SliceIndex, SlicePlan};
pub use self::store::{BackingStore, OpenMode, RawFileStore, StoreHandle};

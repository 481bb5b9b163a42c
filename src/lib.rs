//! This file is the root of the `sliceflow` crate.
//!
//! Its responsibilities are strictly limited to:
//! 1.  Declaring the top-level modules of the library (`data`, `stage`, `runtime`, ...).
//! 2.  Re-exporting the types a pipeline author needs, so they can
//!     `use sliceflow::{Pipeline, Stage, ...}` without knowing the module layout.

//==================================================================================
// 0. Constants
//==================================================================================
/// The crate version, automatically set from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
//==================================================================================
// 1. Module Declarations
//==================================================================================
#[macro_use]
mod observability; // Make macros available throughout the crate

pub mod config;
pub mod data;
pub mod error;
pub mod runtime;
pub mod stage;
pub mod stages;

//==================================================================================
// 2. Public API Re-exports
//==================================================================================
pub use config::{PipelineDefinition, RunConfig, StageEntry};
pub use data::{Backing, BackingStore, Chunk, Dataset, Pattern, RawFileStore, SlicePlan};
pub use error::{ErrorClass, PipelineError, Result};
pub use observability::init_logging;
pub use runtime::{run_local, BasicTransport, Communicator, LocalCommunicator, Pipeline, Requirement, SourceSpec, Transport};
pub use stage::{Citation, InputRequirement, OutputSpec, ParamSpec, ParamType, ParamValue, Parameters, Stage, StageContext, StageSetup};

//! The execution side of the engine: the worker fleet and how it coordinates,
//! which workers run a stage, the transport that moves datasets between stages,
//! and the driver that walks the pipeline.

//==================================================================================
// 1. Module Declarations
//==================================================================================

pub mod comm;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod launch;
pub mod transport;

//==================================================================================
// 2. Public API Re-exports
//==================================================================================
pub use self::comm::{broadcast, Communicator, LocalCommunicator};
pub use self::context::RunContext;
pub use self::dispatch::{Requirement, RunDecision};
pub use self::driver::Pipeline;
pub use self::launch::{run_local, SourceSpec};
pub use self::transport::{BasicTransport, DataFlow, Transport};

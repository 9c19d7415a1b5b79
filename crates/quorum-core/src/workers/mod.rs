//! Worker orchestration: registration, runtime abstraction, and dispatch.
//!
//! The orchestrator is a disciplined consumer of the transaction runner.
//! Worker occupancy is treated exactly like a resource lock: reservation is
//! all-or-nothing, conflicts surface as `LOCKED`, and a reserved worker is
//! always returned to a resolved state no matter how execution ends.

pub mod dispatch;
pub mod registry;
pub mod runtime;

pub use dispatch::{DispatchInput, Dispatcher};
pub use registry::{WorkerRegistry, WorkerSpec};
pub use runtime::{
    ApiRuntime, Invocation, ProcessRuntime, RuntimeOutcome, RuntimeRegistry, WorkerRuntime,
    BASELINE_MODE, TRUNCATION_MARKER,
};

//! # Quorum Core
//!
//! Coordination kernel for multiple autonomous agent processes sharing one
//! mutable project state: tasks, resource locks, and dispatched worker
//! runs. Four tightly coupled pieces:
//!
//! - [`store::DocumentStore`]: the transactional document store - one JSON
//!   document on disk, optimistic concurrency control, durable atomic
//!   persistence, and revision change notification.
//! - [`txn`]: the generic retry-on-conflict transaction runner built on it.
//! - [`locks::LockManager`]: named-resource mutual exclusion with TTL
//!   expiry, re-entrancy, and all-or-nothing batch acquisition.
//! - [`workers`]: the orchestration engine - worker reservation, multi-step
//!   dispatch strategies, per-step timeouts, and runtime fallback.
//!
//! Data flows one way: the lock manager and orchestrator never touch disk;
//! they only call the transaction runner, which only calls the store.
//!
//! ## Laws (Compiler Enforced)
//!
//! - No `unwrap()` - returns `Result` instead
//! - No `expect()` - returns `Result` instead
//! - No `panic!()` - returns `Result` instead
//! - No `unsafe` - safe Rust only
//!
//! ## Error Handling
//!
//! All fallible operations return `Result<T, Error>` carrying one of five
//! machine-readable codes; see [`Error`].

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod config;
pub mod document;
mod error;
pub mod kernel;
pub mod locks;
pub mod panic;
pub mod paths;
pub mod store;
pub mod txn;
pub mod workers;

pub use config::KernelConfig;
pub use document::{
    DispatchStrategy, Document, FallbackPolicy, ResourceLock, RunStatus, RuntimeMode, Task,
    TaskStatus, WorkerModel, WorkerRegistration, WorkerRole, WorkerRun, WorkerRunStep,
    WorkerStatus, SCHEMA_VERSION,
};
pub use error::{Error, Result};
pub use kernel::Kernel;
pub use locks::LockManager;
pub use panic::{is_panic_mode, set_panic_mode};
pub use paths::{NormalizationStrategy, PathJail, WorkspaceJail};
pub use store::DocumentStore;
pub use txn::{run_txn, run_txn_with_retries, DEFAULT_MAX_RETRIES};
pub use workers::{
    ApiRuntime, DispatchInput, Dispatcher, Invocation, ProcessRuntime, RuntimeOutcome,
    RuntimeRegistry, WorkerRegistry, WorkerRuntime, WorkerSpec, BASELINE_MODE, TRUNCATION_MARKER,
};

//! One-stop kernel assembly.
//!
//! The calling facade constructs a [`Kernel`] from operator configuration
//! and a path jail, then talks to the store, lock manager, worker registry,
//! and dispatcher through its accessors. All four share one document store.

use std::sync::Arc;

use crate::{
    config::KernelConfig,
    locks::LockManager,
    paths::PathJail,
    store::DocumentStore,
    workers::{dispatch::Dispatcher, registry::WorkerRegistry, runtime::RuntimeRegistry},
    Result,
};

/// The assembled coordination kernel.
#[derive(Clone)]
pub struct Kernel {
    store: Arc<DocumentStore>,
    locks: LockManager,
    registry: WorkerRegistry,
    dispatcher: Dispatcher,
}

impl Kernel {
    /// Assemble the kernel: open the store at the configured path, read the
    /// lock capability file if configured, and wire the stock runtimes.
    pub fn bootstrap(config: KernelConfig, jail: Arc<dyn PathJail>) -> Result<Self> {
        let store = Arc::new(DocumentStore::open(&config.state_path));
        let locks = LockManager::from_config(Arc::clone(&store), &config)?;
        let registry = WorkerRegistry::new(Arc::clone(&store), jail);
        let runtimes = RuntimeRegistry::with_defaults(&config);
        let dispatcher = Dispatcher::new(Arc::clone(&store), runtimes, config);
        Ok(Self {
            store,
            locks,
            registry,
            dispatcher,
        })
    }

    /// The shared document store.
    #[must_use]
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// The resource lock manager.
    #[must_use]
    pub const fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// The worker registry.
    #[must_use]
    pub const fn workers(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// The dispatch engine.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

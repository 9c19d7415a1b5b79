//! Operator configuration for the kernel.

use std::{path::PathBuf, time::Duration};

/// Default per-step timeout for worker invocations.
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 600;

/// Grace window between SIGTERM and SIGKILL for a timed-out worker process.
const DEFAULT_SIGKILL_GRACE_MS: u64 = 5_000;

/// Capture cap for each of a child's stdout and stderr streams.
const DEFAULT_OUTPUT_CAP_BYTES: usize = 1_048_576;

/// Kernel-wide configuration.
///
/// Construct with [`KernelConfig::new`] and adjust with the `with_*`
/// builders; every knob has a sensible default.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Path of the persisted project document.
    pub state_path: PathBuf,
    /// Path of the lock capability probe output. `None` means the probe has
    /// not run and resource paths are not case-folded.
    pub capability_path: Option<PathBuf>,
    /// Per-step timeout for worker invocations.
    pub step_timeout: Duration,
    /// Grace window between SIGTERM and SIGKILL.
    pub sigkill_grace: Duration,
    /// Per-stream capture cap for child process output.
    pub output_cap: usize,
}

impl KernelConfig {
    /// Create a configuration for the given document path.
    #[must_use]
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            capability_path: None,
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            sigkill_grace: Duration::from_millis(DEFAULT_SIGKILL_GRACE_MS),
            output_cap: DEFAULT_OUTPUT_CAP_BYTES,
        }
    }

    /// Set the capability probe file path.
    #[must_use]
    pub fn with_capability_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.capability_path = Some(path.into());
        self
    }

    /// Set the per-step worker timeout.
    #[must_use]
    pub const fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Set the SIGTERM-to-SIGKILL grace window.
    #[must_use]
    pub const fn with_sigkill_grace(mut self, grace: Duration) -> Self {
        self.sigkill_grace = grace;
        self
    }

    /// Set the per-stream output capture cap.
    #[must_use]
    pub const fn with_output_cap(mut self, cap: usize) -> Self {
        self.output_cap = cap;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config = KernelConfig::new("/tmp/state.json");
        assert_eq!(config.step_timeout.as_secs(), DEFAULT_STEP_TIMEOUT_SECS);
        assert_eq!(config.output_cap, DEFAULT_OUTPUT_CAP_BYTES);
        assert!(config.capability_path.is_none());
    }

    #[test]
    fn builders_override_defaults() {
        let config = KernelConfig::new("/tmp/state.json")
            .with_step_timeout(Duration::from_secs(5))
            .with_sigkill_grace(Duration::from_millis(100))
            .with_output_cap(4_096)
            .with_capability_path("/tmp/caps.json");
        assert_eq!(config.step_timeout, Duration::from_secs(5));
        assert_eq!(config.sigkill_grace, Duration::from_millis(100));
        assert_eq!(config.output_cap, 4_096);
        assert!(config.capability_path.is_some());
    }
}

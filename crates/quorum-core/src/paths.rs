//! Resource path normalization and the path-jail collaborator seam.
//!
//! Lock resources are identified by normalized absolute paths. Whether two
//! paths that differ only in case name the same file is a property of the
//! host filesystem, not something to hard-code, so the fold decision is
//! read from a small capability file produced by an environment probe.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How resource paths are case-folded before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationStrategy {
    /// Case-insensitive filesystem: fold to lowercase so `A.txt` and
    /// `a.txt` conflict.
    Lowercase,
    /// Case-sensitive filesystem: compare paths verbatim.
    #[default]
    None,
}

/// On-disk shape of the capability probe output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockCapability {
    pub normalization_strategy: NormalizationStrategy,
}

/// Load the normalization strategy from the capability file.
///
/// An absent file means the probe has not run yet and defaults to no
/// folding; a present but malformed file fails closed with
/// `VALIDATION_FAILED`.
pub fn load_capability(path: &Path) -> Result<NormalizationStrategy> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(NormalizationStrategy::None);
        }
        Err(e) => {
            return Err(Error::internal(format!(
                "failed to read capability file '{}': {e}",
                path.display()
            )));
        }
    };

    let capability: LockCapability = serde_json::from_str(&contents).map_err(|e| {
        Error::validation(format!(
            "capability file '{}' is malformed: {e}",
            path.display()
        ))
    })?;
    Ok(capability.normalization_strategy)
}

/// Probe whether the filesystem hosting `dir` is case-insensitive and write
/// the capability file at `out_path`.
///
/// The probe round-trips a lowercase marker file through an uppercased
/// name: if the uppercase spelling resolves, the filesystem folds case and
/// lock resources must be lowercased to conflict correctly.
pub fn probe_case_sensitivity(dir: &Path, out_path: &Path) -> Result<NormalizationStrategy> {
    let marker = dir.join(format!(".quorum-case-probe-{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&marker, b"probe")?;

    let upper = marker
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_uppercase)
        .map(|n| dir.join(n));
    let folded = upper.is_some_and(|p| p.exists());

    let _ = std::fs::remove_file(&marker);

    let strategy = if folded {
        NormalizationStrategy::Lowercase
    } else {
        NormalizationStrategy::None
    };

    let capability = LockCapability {
        normalization_strategy: strategy,
    };
    let json = serde_json::to_string_pretty(&capability)
        .map_err(|e| Error::internal(format!("failed to serialize capability: {e}")))?;
    std::fs::write(out_path, json)?;

    tracing::info!(strategy = ?strategy, "lock capability probe complete");
    Ok(strategy)
}

/// Normalize a lock resource: absolute-resolve lexically (no symlink
/// following; the lock table is logical) and apply the case fold.
pub fn normalize_resource(raw: &str, strategy: NormalizationStrategy) -> Result<String> {
    if raw.trim().is_empty() {
        return Err(Error::validation("resource path must not be empty"));
    }

    let path = Path::new(raw);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| Error::internal(format!("failed to resolve working directory: {e}")))?
            .join(path)
    };

    let normalized = lexical_normalize(&absolute);
    let mut out = normalized.to_string_lossy().into_owned();
    if strategy == NormalizationStrategy::Lowercase {
        out = out.to_lowercase();
    }
    Ok(out)
}

/// Collapse `.` and `..` components without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Never pop above the root.
                if out.parent().is_some() {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// The external path-jailing collaborator, consumed as an opaque service.
///
/// `validate` returns a safe path or rejects; `resolve` normalizes without
/// the safety check.
pub trait PathJail: Send + Sync {
    /// Validate that `path` is safe to use and return its jailed form.
    fn validate(&self, path: &Path) -> Result<PathBuf>;

    /// Normalize `path` without the safety check.
    fn resolve(&self, path: &Path) -> Result<PathBuf>;
}

/// Default jail implementation: confines paths to a workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceJail {
    root: PathBuf,
}

impl WorkspaceJail {
    /// Create a jail rooted at `root` (normalized lexically).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: lexical_normalize(&root.into()),
        }
    }

    /// The jail root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PathJail for WorkspaceJail {
    fn validate(&self, path: &Path) -> Result<PathBuf> {
        let resolved = self.resolve(path)?;
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(Error::validation(format!(
                "path '{}' escapes the workspace root '{}'",
                path.display(),
                self.root.display()
            )))
        }
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        Ok(lexical_normalize(&absolute))
    }
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use switchyard_core::{SwitchyardError, SwitchyardResult};

/// Bounds enforced on one sandboxed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Wall-clock budget including commit.
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    /// Maximum rows returned or affected.
    #[serde(default = "default_max_rows")]
    pub max_rows: u64,
    /// Maximum bytes of returned cell data.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_max_duration_ms() -> u64 {
    5_000
}

fn default_max_rows() -> u64 {
    10_000
}

fn default_max_bytes() -> u64 {
    8 * 1024 * 1024
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_duration_ms: default_max_duration_ms(),
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl SandboxLimits {
    pub fn validate(&self) -> SwitchyardResult<()> {
        if self.max_duration_ms == 0 || self.max_rows == 0 || self.max_bytes == 0 {
            return Err(SwitchyardError::Config(
                "sandbox limits must all be > 0".into(),
            ));
        }
        Ok(())
    }

    /// The stricter of `self` and `requested`, field by field. Callers can
    /// narrow the configured limits but never widen them.
    pub fn tightened_by(&self, requested: &SandboxLimits) -> SandboxLimits {
        SandboxLimits {
            max_duration_ms: self.max_duration_ms.min(requested.max_duration_ms),
            max_rows: self.max_rows.min(requested.max_rows),
            max_bytes: self.max_bytes.min(requested.max_bytes),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// SQLite database file. `None` opens a private in-memory database.
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub limits: SandboxLimits,
    /// Directory for `sandbox-audit.jsonl`. `None` keeps the audit in memory only.
    #[serde(default)]
    pub audit_dir: Option<PathBuf>,
    /// Entries kept in the in-memory audit ring.
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

fn default_audit_capacity() -> usize {
    1_000
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            database: None,
            limits: SandboxLimits::default(),
            audit_dir: None,
            audit_capacity: default_audit_capacity(),
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> SwitchyardResult<()> {
        self.limits.validate()?;
        if self.audit_capacity == 0 {
            return Err(SwitchyardError::Config("audit_capacity must be > 0".into()));
        }
        Ok(())
    }
}

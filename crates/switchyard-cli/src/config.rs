use serde::Deserialize;
use std::path::{Path, PathBuf};
use switchyard_bus::BusConfig;
use switchyard_core::{SwitchyardError, SwitchyardResult};
use switchyard_orchestrator::{HealthConfig, OrchestratorConfig};
use switchyard_sandbox::SandboxConfig;

/// Contents of `switchyard.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SwitchyardConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Directory for persisted descriptors and executions. Unset disables
    /// persistence.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

impl SwitchyardConfig {
    /// Read and validate `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> SwitchyardResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config = Self::parse(&text)?;
        Ok(config.resolve_relative_to(path.parent().unwrap_or_else(|| Path::new("."))))
    }

    pub fn parse(text: &str) -> SwitchyardResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| SwitchyardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SwitchyardResult<()> {
        self.bus.validate()?;
        self.orchestrator.validate()?;
        self.health.validate()?;
        self.sandbox.validate()
    }

    /// Relative paths in the file are taken relative to the file itself.
    fn resolve_relative_to(mut self, base: &Path) -> Self {
        let rebase = |p: &mut Option<PathBuf>| {
            if let Some(path) = p.as_mut() {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        };
        rebase(&mut self.sandbox.database);
        rebase(&mut self.sandbox.audit_dir);
        rebase(&mut self.state_dir);
        rebase(&mut self.bus.persist_dir);
        self
    }
}

//! Runtime configuration types.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// JIT enabled (compile hot functions in the background)
    On,
    /// Same as `On`; kept so configs can leave the choice to the runtime
    #[default]
    Auto,
}

impl JitMode {
    pub fn is_enabled(self) -> bool {
        !matches!(self, JitMode::Off)
    }
}

/// Which backend turns lowered functions into executable code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitterKind {
    /// Isolated handler dispatch; no calls, no heap access
    Baseline,
    /// Runs directly on the VM's stack, heap and call frames
    #[default]
    VmIntegrated,
}

/// Runtime configuration for the VM and JIT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    pub jit_emitter: EmitterKind,
    /// Apply constant folding and dead-code elimination before emitting
    pub jit_optimize: bool,
    /// Calls observed before a function is queued for compilation
    pub jit_threshold: u32,
    /// Background compile threads
    pub jit_workers: usize,
    /// Whether GC is enabled (default: true)
    pub gc_enabled: bool,
    /// Allocations since the last collection that trigger the next one
    pub gc_threshold: usize,
    pub gc_stats: bool,
    /// Global slots available before any STORE_GLOBAL grows the array
    pub globals_capacity: usize,
    pub max_globals: usize,
    /// Largest array length or struct field count one allocation may ask for
    pub max_alloc_len: usize,
    /// Entry frame locals when no function starts at ip 0
    pub entry_locals: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_emitter: EmitterKind::VmIntegrated,
            jit_optimize: true,
            jit_threshold: 1,
            jit_workers: 2,
            gc_enabled: true,
            gc_threshold: 1000,
            gc_stats: false,
            globals_capacity: 256,
            max_globals: 65536,
            max_alloc_len: 1 << 24,
            entry_locals: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl RuntimeConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jit_workers == 0 {
            return Err(ConfigError::Invalid("jit_workers must be at least 1".into()));
        }
        if self.globals_capacity > self.max_globals {
            return Err(ConfigError::Invalid(format!(
                "globals_capacity {} exceeds max_globals {}",
                self.globals_capacity, self.max_globals
            )));
        }
        if self.max_alloc_len == 0 {
            return Err(ConfigError::Invalid("max_alloc_len must be at least 1".into()));
        }
        Ok(())
    }
}

//! Runtime configuration types.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// Compile every method on its first call
    On,
    /// Compile a method once it has been called `jit_threshold` times
    #[default]
    Auto,
}

/// Runtime configuration for the VM
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    pub jit_threshold: u32,
    /// Raise the `stackjit::jit` log target to `trace`
    pub trace_jit: bool,
    /// Operand stack capacity in words, per thread
    pub op_stack_size: usize,
    /// Deepest allowed method nesting
    pub max_call_depth: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_threshold: 1,
            trace_jit: false,
            op_stack_size: 4096,
            max_call_depth: 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0} must be at least 1")]
    Invalid(&'static str),
}

impl RuntimeConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.op_stack_size == 0 {
            return Err(ConfigError::Invalid("op_stack_size"));
        }
        if self.max_call_depth < 1 {
            return Err(ConfigError::Invalid("max_call_depth"));
        }
        Ok(())
    }

    /// Calls a method needs before it is compiled; `None` when the JIT is off.
    pub fn compile_threshold(&self) -> Option<u32> {
        match self.jit_mode {
            JitMode::Off => None,
            JitMode::On => Some(1),
            JitMode::Auto => Some(self.jit_threshold.max(1)),
        }
    }
}

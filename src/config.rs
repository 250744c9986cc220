//! Engine configuration, threaded explicitly into build and execution.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max_chunk_len must be at least 1")]
    ZeroChunkLen,
    #[error("max_locals is {max_locals} but promotion needs at least one local")]
    NoLocals { max_locals: usize },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which implementation runs a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Interpreter,
    /// Cranelift IR built directly from the instruction range.
    Native,
    /// Textual CLIF, compiled in batches.
    Source,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Interpreter => write!(f, "interpreter"),
            BackendKind::Native => write!(f, "native"),
            BackendKind::Source => write!(f, "source"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hoisting threshold: no leaf is longer than this after `finish`.
    pub max_chunk_len: usize,
    /// A leaf range is compiled once `len × references` reaches this.
    pub min_compile_len: usize,
    /// Backend used for leaves that qualify for compilation.
    pub compiled_backend: BackendKind,
    /// Run parallel chunks' children on the rayon pool.
    pub parallel: bool,
    /// Promote hot slots to locals in the source backend.
    pub promote_locals: bool,
    pub min_local_uses: usize,
    pub max_locals: usize,
    /// Record a trace event at every chunk boundary.
    pub trace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_chunk_len: 1_000,
            min_compile_len: 64,
            compiled_backend: if cfg!(feature = "cranelift") {
                BackendKind::Native
            } else {
                BackendKind::Interpreter
            },
            parallel: false,
            promote_locals: true,
            min_local_uses: 3,
            max_locals: 32,
            trace: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_len == 0 {
            return Err(ConfigError::ZeroChunkLen);
        }
        if self.promote_locals && self.compiled_backend == BackendKind::Source && self.max_locals == 0 {
            return Err(ConfigError::NoLocals { max_locals: self.max_locals });
        }
        Ok(())
    }

    /// Everything through the interpreter; useful as a reference run.
    pub fn interpreted() -> Self {
        EngineConfig { compiled_backend: BackendKind::Interpreter, ..EngineConfig::default() }
    }

    /// Every leaf compiled with `backend`, whatever its size.
    pub fn compiled(backend: BackendKind) -> Self {
        EngineConfig { compiled_backend: backend, min_compile_len: 0, ..EngineConfig::default() }
    }
}

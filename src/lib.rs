//! arrayvm: a virtual machine for straight-line numeric array programs.
//!
//! A [`Builder`] emits instructions over a scratch array of `f64` slots and
//! groups them into chunks. [`Builder::finish`] freezes the result into a
//! [`Program`], whose chunk tree is hoisted so no leaf exceeds the configured
//! length. An [`Engine`] prepares every leaf with the interpreter or one of
//! the compiled backends and walks the tree against an input and an output
//! buffer.

pub mod backend;
pub mod builder;
pub mod command;
pub mod config;
pub mod engine;
pub mod liveness;
pub mod program;
pub mod tree;

#[cfg(test)]
mod testing;

pub use backend::{CodegenError, ExecError, ExecResult, SessionError};
pub use builder::templates::{ParameterFrame, RecordedRange, RepeatedWindow};
pub use builder::{BuildError, BuildResult, Builder, Slot};
pub use command::{Instruction, Opcode};
pub use config::{BackendKind, ConfigError, EngineConfig};
pub use engine::{Engine, RunOutcome, Trace, TraceEvent};
pub use program::Program;
pub use tree::{ChunkId, ChunkKind, ChunkTree};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Prepares `program` under `config` and runs it once.
pub fn run(program: &Program, config: &EngineConfig, inputs: &[f64], outputs: &mut [f64]) -> Result<RunOutcome, Error> {
    let engine = Engine::new(program.clone(), config)?;
    Ok(engine.run(inputs, outputs)?)
}

//! Execution backends.
//!
//! A `Backend` turns leaf ranges of a program into `Routine`s; a routine runs
//! exactly its range against an `ExecState`. The interpreter is always
//! available. The native and source backends compile through Cranelift and
//! need the `cranelift` feature.

pub mod interp;

#[cfg(feature = "cranelift")]
pub mod clif_source;
#[cfg(feature = "cranelift")]
pub mod jit_cranelift;

use std::any::Any;
use std::fmt;
use std::mem::offset_of;
use std::ops::Range;
use std::sync::Arc;

use crate::command::{Instruction, Opcode, StreamCounts};
use crate::config::{BackendKind, ConfigError, EngineConfig};
use crate::program::Program;

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("input stream exhausted: {needed} value(s) needed at cursor {cursor}, {len} supplied")]
    InputExhausted { cursor: usize, needed: usize, len: usize },
    #[error("output buffer overflow: {needed} value(s) needed at cursor {cursor}, buffer holds {len}")]
    OutputOverflow { cursor: usize, needed: usize, len: usize },
    #[error("accumulated output o{index} outside the output buffer ({len} values)")]
    AccumulateOutOfRange { index: usize, len: usize },
    #[error("scratch array has {len} slots but s{slot} is used")]
    ScratchTooSmall { len: usize, slot: usize },
    #[error("data index {index} out of range ({len} values)")]
    SourceOutOfRange { index: usize, len: usize },
    #[error("no prepared routine for range {start}..{end} of program {program:016x}")]
    MissingArtifact { program: u64, start: usize, end: usize },
    #[error("stale chunk tree: artifacts were prepared for program {expected:016x}, not {found:016x}")]
    StaleTree { expected: u64, found: u64 },
    #[error("{backend} backend is not available in this build")]
    BackendUnavailable { backend: BackendKind },
    #[error("range {start}..{end} has unmatched conditionals")]
    UnbalancedRange { start: usize, end: usize },
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ExecResult<T> = Result<T, ExecError>;

/// Native-emission or source-compilation failure for one range.
#[derive(Debug, thiserror::Error)]
#[error("{backend} codegen failed for program {program:016x}, range {start}..{end}: {message}")]
pub struct CodegenError {
    pub backend: BackendKind,
    pub program: u64,
    pub start: usize,
    pub end: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session already committed; no more units can be registered")]
    AlreadyCommitted,
    #[error("session not committed yet")]
    NotCommitted,
    #[error("nothing registered to commit")]
    Empty,
    #[error("an earlier commit failed; start a new session")]
    Failed,
    #[error("unit {0} was never registered")]
    UnknownUnit(usize),
}

// ── Execution state ──────────────────────────────────────────────────

/// Everything one routine may touch. Cursors index `inputs` and `outputs`.
#[derive(Debug)]
pub struct ExecState<'a> {
    pub scratch: &'a mut [f64],
    pub inputs: &'a [f64],
    pub outputs: &'a mut [f64],
    pub input_cursor: usize,
    pub output_cursor: usize,
    pub flag: bool,
}

impl<'a> ExecState<'a> {
    pub fn new(scratch: &'a mut [f64], inputs: &'a [f64], outputs: &'a mut [f64]) -> Self {
        ExecState { scratch, inputs, outputs, input_cursor: 0, output_cursor: 0, flag: false }
    }
}

// ── Contract ─────────────────────────────────────────────────────────

pub trait Routine: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;
    fn range(&self) -> Range<usize>;
    /// Runs the range. Only the scratch array, the output buffer, both
    /// cursors and the flag are modified.
    fn execute(&self, state: &mut ExecState<'_>) -> ExecResult<()>;
}

pub trait Backend {
    fn kind(&self) -> BackendKind;
    /// Queues `range` of `program`.
    fn prepare(&mut self, program: &Program, range: Range<usize>) -> ExecResult<()>;
    /// Produces a routine for every prepared range, in preparation order.
    fn finish(self: Box<Self>) -> ExecResult<Vec<Arc<dyn Routine>>>;
}

/// Creates the backend for `kind`.
pub fn backend_for(kind: BackendKind, config: &EngineConfig) -> ExecResult<Box<dyn Backend>> {
    match kind {
        BackendKind::Interpreter => Ok(Box::new(interp::Interpreter::default())),
        #[cfg(feature = "cranelift")]
        BackendKind::Native => Ok(Box::new(jit_cranelift::NativeBackend::new())),
        #[cfg(feature = "cranelift")]
        BackendKind::Source => Ok(Box::new(clif_source::SourceBackend::new(config))),
        #[cfg(not(feature = "cranelift"))]
        backend => {
            let _ = config;
            Err(ExecError::BackendUnavailable { backend })
        }
    }
}

/// Chooses a backend for a leaf range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendPolicy {
    pub min_compile_len: usize,
    pub compiled: BackendKind,
}

impl BackendPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        BackendPolicy { min_compile_len: config.min_compile_len, compiled: config.compiled_backend }
    }

    /// `references` is how many leaves of the tree share the range.
    pub fn select(&self, len: usize, references: usize) -> BackendKind {
        if len == 0 || len.saturating_mul(references) < self.min_compile_len {
            BackendKind::Interpreter
        } else {
            self.compiled
        }
    }
}

// ── Compiled routines ────────────────────────────────────────────────

/// What compiled code sees. Field offsets are part of the generated code.
#[repr(C)]
#[derive(Debug)]
pub struct Frame {
    pub scratch: *mut f64,
    pub inputs: *const f64,
    pub outputs: *mut f64,
    pub input_cursor: u64,
    pub output_cursor: u64,
    pub flag: u8,
}

pub(crate) const FRAME_SCRATCH: i32 = offset_of!(Frame, scratch) as i32;
pub(crate) const FRAME_INPUTS: i32 = offset_of!(Frame, inputs) as i32;
pub(crate) const FRAME_OUTPUTS: i32 = offset_of!(Frame, outputs) as i32;
pub(crate) const FRAME_INPUT_CURSOR: i32 = offset_of!(Frame, input_cursor) as i32;
pub(crate) const FRAME_OUTPUT_CURSOR: i32 = offset_of!(Frame, output_cursor) as i32;
pub(crate) const FRAME_FLAG: i32 = offset_of!(Frame, flag) as i32;

pub type RoutineFn = unsafe extern "C" fn(*mut Frame);

/// Static bounds of a range, checked before compiled code runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeNeeds {
    pub max_slot: Option<u32>,
    pub stream: StreamCounts,
    pub max_accumulate: Option<u32>,
}

impl RangeNeeds {
    pub fn of(code: &[Instruction]) -> Self {
        RangeNeeds {
            max_slot: code.iter().filter_map(Instruction::max_slot).max(),
            stream: StreamCounts::of(code),
            max_accumulate: code.iter().filter(|i| i.op == Opcode::AccumulateOutput).map(|i| i.index).max(),
        }
    }

    pub fn check(&self, state: &ExecState<'_>) -> ExecResult<()> {
        if let Some(slot) = self.max_slot {
            if slot as usize >= state.scratch.len() {
                return Err(ExecError::ScratchTooSmall { len: state.scratch.len(), slot: slot as usize });
            }
        }
        if state.inputs.len().saturating_sub(state.input_cursor) < self.stream.inputs {
            return Err(ExecError::InputExhausted {
                cursor: state.input_cursor,
                needed: self.stream.inputs,
                len: state.inputs.len(),
            });
        }
        if state.outputs.len().saturating_sub(state.output_cursor) < self.stream.outputs {
            return Err(ExecError::OutputOverflow {
                cursor: state.output_cursor,
                needed: self.stream.outputs,
                len: state.outputs.len(),
            });
        }
        if let Some(index) = self.max_accumulate {
            if index as usize >= state.outputs.len() {
                return Err(ExecError::AccumulateOutOfRange { index: index as usize, len: state.outputs.len() });
            }
        }
        Ok(())
    }
}

/// A finalized function plus whatever owns its code memory.
pub struct CompiledRoutine {
    kind: BackendKind,
    range: Range<usize>,
    needs: RangeNeeds,
    entry: RoutineFn,
    _owner: Arc<dyn Any + Send + Sync>,
}

impl CompiledRoutine {
    /// # Safety
    /// `entry` must implement `range` over a `Frame`, touching no memory
    /// beyond what `needs` describes, and stay valid while `owner` lives.
    pub(crate) unsafe fn new(
        kind: BackendKind,
        range: Range<usize>,
        needs: RangeNeeds,
        entry: RoutineFn,
        owner: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        CompiledRoutine { kind, range, needs, entry, _owner: owner }
    }
}

impl fmt::Debug for CompiledRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRoutine")
            .field("kind", &self.kind)
            .field("range", &self.range)
            .field("needs", &self.needs)
            .finish_non_exhaustive()
    }
}

impl Routine for CompiledRoutine {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    fn execute(&self, state: &mut ExecState<'_>) -> ExecResult<()> {
        self.needs.check(state)?;
        let mut frame = Frame {
            scratch: state.scratch.as_mut_ptr(),
            inputs: state.inputs.as_ptr(),
            outputs: state.outputs.as_mut_ptr(),
            input_cursor: state.input_cursor as u64,
            output_cursor: state.output_cursor as u64,
            flag: state.flag as u8,
        };
        // SAFETY: `check` proved every slot, stream position and accumulated
        // output the routine can reach lies inside the borrowed buffers.
        unsafe { (self.entry)(&mut frame) };
        state.input_cursor = frame.input_cursor as usize;
        state.output_cursor = frame.output_cursor as usize;
        state.flag = frame.flag != 0;
        Ok(())
    }
}

#[cfg(feature = "cranelift")]
pub(crate) fn jit_module(backend: BackendKind) -> Result<cranelift_jit::JITModule, String> {
    use cranelift_codegen::settings::{self, Configurable};

    let mut flag_builder = settings::builder();
    flag_builder.set("opt_level", "speed").map_err(|e| e.to_string())?;
    let isa_builder = cranelift_native::builder().map_err(|e| format!("{backend}: {e}"))?;
    let isa = isa_builder.finish(settings::Flags::new(flag_builder)).map_err(|e| e.to_string())?;
    Ok(cranelift_jit::JITModule::new(cranelift_jit::JITBuilder::with_isa(
        isa,
        cranelift_module::default_libcall_names(),
    )))
}

/// Keeps a JIT module's code memory alive for the routines pointing into it,
/// and returns the memory once the last of them is gone.
#[cfg(feature = "cranelift")]
pub(crate) struct JitModuleHandle(std::mem::ManuallyDrop<cranelift_jit::JITModule>);

#[cfg(feature = "cranelift")]
impl JitModuleHandle {
    pub(crate) fn new(module: cranelift_jit::JITModule) -> Self {
        JitModuleHandle(std::mem::ManuallyDrop::new(module))
    }
}

#[cfg(feature = "cranelift")]
impl Drop for JitModuleHandle {
    fn drop(&mut self) {
        // SAFETY: routines hold the handle through an `Arc`, so none of the
        // module's functions can be called once it drops. The module is
        // taken exactly once.
        unsafe { std::mem::ManuallyDrop::take(&mut self.0).free_memory() };
    }
}

/// Frees a module that never produced a routine.
#[cfg(feature = "cranelift")]
pub(crate) fn discard_module(module: cranelift_jit::JITModule) {
    // SAFETY: no function pointer was ever taken from `module`.
    unsafe { module.free_memory() };
}

// SAFETY: the module is never mutated after finalization; the handle only
// pins its memory while routines built from it exist.
#[cfg(feature = "cranelift")]
unsafe impl Send for JitModuleHandle {}
#[cfg(feature = "cranelift")]
unsafe impl Sync for JitModuleHandle {}

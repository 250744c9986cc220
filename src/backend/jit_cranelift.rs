//! Native-emission backend: builds Cranelift IR straight from a range.
//!
//! Slots stay in memory; every access is a load or store against the scratch
//! base. Cursors and the flag are frontend variables, so the SSA builder
//! threads them through conditional blocks. All ranges prepared on one
//! backend share a JIT module, finalized once by `finish`.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use cranelift_codegen::ir::condcodes::FloatCC;
use cranelift_codegen::ir::types::{F64, I64, I8};
use cranelift_codegen::ir::{AbiParam, Block, InstBuilder, MemFlags, Value};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Linkage, Module};
use tracing::{debug, info, instrument};

use super::{
    discard_module, jit_module, Backend, CodegenError, CompiledRoutine, ExecResult, JitModuleHandle, RangeNeeds,
    Routine, RoutineFn, FRAME_FLAG, FRAME_INPUTS, FRAME_INPUT_CURSOR, FRAME_OUTPUTS, FRAME_OUTPUT_CURSOR,
    FRAME_SCRATCH,
};
use crate::command::{Instruction, Opcode};
use crate::config::BackendKind;
use crate::program::Program;

/// A function defined in the module but not finalized yet.
#[derive(Debug)]
struct Pending {
    id: FuncId,
    program: u64,
    range: Range<usize>,
    needs: RangeNeeds,
}

pub struct NativeBackend {
    module: Option<JITModule>,
    ctx: Context,
    builder_ctx: FunctionBuilderContext,
    pending: Vec<Pending>,
}

impl fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBackend").field("pending", &self.pending.len()).finish_non_exhaustive()
    }
}

impl Default for NativeBackend {
    fn default() -> Self {
        NativeBackend {
            module: None,
            ctx: Context::new(),
            builder_ctx: FunctionBuilderContext::new(),
            pending: Vec::new(),
        }
    }
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            discard_module(module);
        }
    }
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits and defines `code[range]` in the shared module.
    pub fn define(&mut self, code: &[Instruction], range: Range<usize>, program: u64) -> Result<(), CodegenError> {
        let fail = |message: String| CodegenError {
            backend: BackendKind::Native,
            program,
            start: range.start,
            end: range.end,
            message,
        };
        let slice = code.get(range.clone()).ok_or_else(|| fail("range outside program".to_string()))?;
        if !crate::command::is_balanced(slice) {
            return Err(fail("unmatched conditionals".to_string()));
        }
        if self.module.is_none() {
            self.module = Some(jit_module(BackendKind::Native).map_err(fail)?);
        }
        let Some(module) = self.module.as_mut() else {
            return Err(fail("no module".to_string()));
        };

        let ptr = module.target_config().pointer_type();
        let mut sig = module.make_signature();
        sig.params.push(AbiParam::new(ptr));
        let name = format!("native_{}_{}_{}", self.pending.len(), range.start, range.end);
        let id = module.declare_function(&name, Linkage::Local, &sig).map_err(|e| fail(e.to_string()))?;

        self.ctx.func.signature = sig;
        let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.builder_ctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);

        let frame = builder.block_params(entry)[0];
        let mut emitter = Emitter::new(&mut builder, frame);
        for inst in slice {
            emitter.emit(inst);
        }
        emitter.epilogue();
        builder.finalize();

        let defined = module.define_function(id, &mut self.ctx).map_err(|e| fail(e.to_string()));
        module.clear_context(&mut self.ctx);
        defined?;
        debug!(start = range.start, end = range.end, len = slice.len(), "native routine defined");
        let needs = RangeNeeds::of(slice);
        self.pending.push(Pending { id, program, range, needs });
        Ok(())
    }

    /// Finalizes every defined function at once.
    #[instrument(skip_all, fields(units = self.pending.len()))]
    pub fn finalize(&mut self) -> Result<Vec<CompiledRoutine>, CodegenError> {
        let Some(mut module) = self.module.take() else {
            return Ok(Vec::new());
        };
        let pending = std::mem::take(&mut self.pending);
        if let Err(e) = module.finalize_definitions() {
            discard_module(module);
            let (program, range) = pending.first().map_or((0, 0..0), |p| (p.program, p.range.clone()));
            return Err(CodegenError {
                backend: BackendKind::Native,
                program,
                start: range.start,
                end: range.end,
                message: e.to_string(),
            });
        }

        let entries: Vec<*const u8> = pending.iter().map(|p| module.get_finalized_function(p.id)).collect();
        let owner = Arc::new(JitModuleHandle::new(module));
        let mut routines = Vec::with_capacity(pending.len());
        for (p, ptr) in pending.into_iter().zip(entries) {
            // SAFETY: the function was declared with the `RoutineFn` signature
            // and `owner` keeps its module alive.
            let entry: RoutineFn = unsafe { std::mem::transmute::<*const u8, RoutineFn>(ptr) };
            // SAFETY: the emitted code touches only the slots, stream positions
            // and accumulated outputs `RangeNeeds` counts for its range.
            routines.push(unsafe { CompiledRoutine::new(BackendKind::Native, p.range, p.needs, entry, owner.clone()) });
        }
        info!(routines = routines.len(), "native batch finalized");
        Ok(routines)
    }
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn prepare(&mut self, program: &Program, range: Range<usize>) -> ExecResult<()> {
        self.define(program.instructions(), range, program.fingerprint())?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> ExecResult<Vec<Arc<dyn Routine>>> {
        let routines = self.finalize()?;
        Ok(routines.into_iter().map(|r| Arc::new(r) as Arc<dyn Routine>).collect())
    }
}

/// Compiles `code[range]` on its own.
pub fn compile(code: &[Instruction], range: Range<usize>, program: u64) -> Result<CompiledRoutine, CodegenError> {
    let mut backend = NativeBackend::new();
    backend.define(code, range.clone(), program)?;
    backend.finalize()?.pop().ok_or(CodegenError {
        backend: BackendKind::Native,
        program,
        start: range.start,
        end: range.end,
        message: "nothing finalized".to_string(),
    })
}

// ── IR emission ──────────────────────────────────────────────────────

struct Emitter<'a, 'b> {
    b: &'a mut FunctionBuilder<'b>,
    frame: Value,
    scratch: Value,
    inputs: Value,
    outputs: Value,
    input_cursor: Variable,
    output_cursor: Variable,
    flag: Variable,
    merges: Vec<Block>,
}

fn mem() -> MemFlags {
    MemFlags::trusted()
}

impl<'a, 'b> Emitter<'a, 'b> {
    fn new(b: &'a mut FunctionBuilder<'b>, frame: Value) -> Self {
        let scratch = b.ins().load(I64, mem(), frame, FRAME_SCRATCH);
        let inputs = b.ins().load(I64, mem(), frame, FRAME_INPUTS);
        let outputs = b.ins().load(I64, mem(), frame, FRAME_OUTPUTS);

        let input_cursor = Variable::from_u32(0);
        let output_cursor = Variable::from_u32(1);
        let flag = Variable::from_u32(2);
        b.declare_var(input_cursor, I64);
        b.declare_var(output_cursor, I64);
        b.declare_var(flag, I8);
        let v = b.ins().load(I64, mem(), frame, FRAME_INPUT_CURSOR);
        b.def_var(input_cursor, v);
        let v = b.ins().load(I64, mem(), frame, FRAME_OUTPUT_CURSOR);
        b.def_var(output_cursor, v);
        let v = b.ins().load(I8, mem(), frame, FRAME_FLAG);
        b.def_var(flag, v);

        Emitter { b, frame, scratch, inputs, outputs, input_cursor, output_cursor, flag, merges: Vec::new() }
    }

    /// Address and immediate offset of element `index` of an f64 array.
    fn element(&mut self, base: Value, index: u32) -> (Value, i32) {
        let offset = i64::from(index) * 8;
        match i32::try_from(offset) {
            Ok(offset) => (base, offset),
            Err(_) => (self.b.ins().iadd_imm(base, offset), 0),
        }
    }

    fn load_slot(&mut self, slot: u32) -> Value {
        let (addr, off) = self.element(self.scratch, slot);
        self.b.ins().load(F64, mem(), addr, off)
    }

    fn store_slot(&mut self, slot: u32, v: Value) {
        let (addr, off) = self.element(self.scratch, slot);
        self.b.ins().store(mem(), v, addr, off);
    }

    /// `base + cursor * 8`, then bumps the cursor.
    fn stream_addr(&mut self, base: Value, cursor: Variable) -> Value {
        let c = self.b.use_var(cursor);
        let bytes = self.b.ins().ishl_imm(c, 3);
        let addr = self.b.ins().iadd(base, bytes);
        let next = self.b.ins().iadd_imm(c, 1);
        self.b.def_var(cursor, next);
        addr
    }

    fn compare(&mut self, cc: FloatCC, inst: &Instruction, literal: bool) {
        let a = self.load_slot(inst.index);
        let b = if literal { self.b.ins().f64const(inst.literal()) } else { self.load_slot(inst.source) };
        let c = self.b.ins().fcmp(cc, a, b);
        self.b.def_var(self.flag, c);
    }

    fn emit(&mut self, inst: &Instruction) {
        match inst.op {
            Opcode::Zero => {
                let z = self.b.ins().f64const(0.0);
                self.store_slot(inst.index, z);
            }
            Opcode::Copy => {
                let v = self.load_slot(inst.source);
                self.store_slot(inst.index, v);
            }
            Opcode::NextInput => {
                let addr = self.stream_addr(self.inputs, self.input_cursor);
                let v = self.b.ins().load(F64, mem(), addr, 0);
                self.store_slot(inst.index, v);
            }
            Opcode::NextOutput => {
                let v = self.load_slot(inst.source);
                let addr = self.stream_addr(self.outputs, self.output_cursor);
                self.b.ins().store(mem(), v, addr, 0);
            }
            Opcode::AccumulateOutput => {
                let v = self.load_slot(inst.source);
                let (addr, off) = self.element(self.outputs, inst.index);
                let old = self.b.ins().load(F64, mem(), addr, off);
                let sum = self.b.ins().fadd(old, v);
                self.b.ins().store(mem(), sum, addr, off);
            }
            Opcode::MultiplyBy | Opcode::IncrementBy | Opcode::DecrementBy => {
                let a = self.load_slot(inst.index);
                let s = self.load_slot(inst.source);
                let r = match inst.op {
                    Opcode::MultiplyBy => self.b.ins().fmul(a, s),
                    Opcode::IncrementBy => self.b.ins().fadd(a, s),
                    _ => self.b.ins().fsub(a, s),
                };
                self.store_slot(inst.index, r);
            }
            Opcode::Equals => self.compare(FloatCC::Equal, inst, false),
            Opcode::NotEquals => self.compare(FloatCC::NotEqual, inst, false),
            Opcode::GreaterThan => self.compare(FloatCC::GreaterThan, inst, false),
            Opcode::LessThan => self.compare(FloatCC::LessThan, inst, false),
            Opcode::EqualsValue => self.compare(FloatCC::Equal, inst, true),
            Opcode::NotEqualsValue => self.compare(FloatCC::NotEqual, inst, true),
            Opcode::If => {
                let body = self.b.create_block();
                let merge = self.b.create_block();
                let f = self.b.use_var(self.flag);
                self.b.ins().brif(f, body, &[], merge, &[]);
                self.b.switch_to_block(body);
                self.b.seal_block(body);
                self.merges.push(merge);
            }
            Opcode::EndIf => {
                // balanced input guarantees a pending merge block
                if let Some(merge) = self.merges.pop() {
                    self.b.ins().jump(merge, &[]);
                    self.b.switch_to_block(merge);
                    self.b.seal_block(merge);
                }
            }
            Opcode::Blank | Opcode::Comment => {}
        }
    }

    fn epilogue(&mut self) {
        let v = self.b.use_var(self.input_cursor);
        self.b.ins().store(mem(), v, self.frame, FRAME_INPUT_CURSOR);
        let v = self.b.use_var(self.output_cursor);
        self.b.ins().store(mem(), v, self.frame, FRAME_OUTPUT_CURSOR);
        let v = self.b.use_var(self.flag);
        self.b.ins().store(mem(), v, self.frame, FRAME_FLAG);
        self.b.ins().return_(&[]);
    }
}

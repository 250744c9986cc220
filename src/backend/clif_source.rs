//! Source-compilation backend.
//!
//! Each range becomes the text of one CLIF function. Units are registered
//! into a `CompileSession`; `commit` parses the whole batch once, defines
//! every function in a single JIT module and finalizes it. With promotion
//! on, the liveness plan's hot slots live in SSA values for the span of
//! their interval and are passed through conditional merge blocks as block
//! parameters.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use cranelift_codegen::ir::immediates::Ieee64;
use cranelift_codegen::Context;
use cranelift_jit::JITModule;
use cranelift_module::{Linkage, Module};
use tracing::{debug, info, instrument};

use super::{
    discard_module, jit_module, Backend, CodegenError, CompiledRoutine, ExecResult, JitModuleHandle, RangeNeeds, Routine, RoutineFn,
    SessionError, FRAME_FLAG, FRAME_INPUTS, FRAME_INPUT_CURSOR, FRAME_OUTPUTS, FRAME_OUTPUT_CURSOR, FRAME_SCRATCH,
};
use crate::command::{is_balanced, Instruction, Opcode};
use crate::config::{BackendKind, EngineConfig};
use crate::liveness::{self, LivenessPlan};
use crate::program::Program;

// ── Backend ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SourceBackend {
    session: CompileSession,
    units: Vec<usize>,
}

impl SourceBackend {
    pub fn new(config: &EngineConfig) -> Self {
        let promotion = config.promote_locals.then_some(Promotion {
            min_uses: config.min_local_uses,
            max_locals: config.max_locals,
        });
        SourceBackend { session: CompileSession::new(promotion), units: Vec::new() }
    }
}

impl Backend for SourceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Source
    }

    fn prepare(&mut self, program: &Program, range: Range<usize>) -> ExecResult<()> {
        let unit = self.session.register(program.fingerprint(), program.instructions(), range)?;
        self.units.push(unit);
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> ExecResult<Vec<Arc<dyn Routine>>> {
        if self.units.is_empty() {
            return Ok(Vec::new());
        }
        self.session.commit()?;
        let mut routines: Vec<Arc<dyn Routine>> = Vec::with_capacity(self.units.len());
        for &unit in &self.units {
            routines.push(self.session.routine(unit)?);
        }
        Ok(routines)
    }
}

// ── Session ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Collecting,
    Committed,
    /// Defining or finalizing the batch failed; the session is unusable.
    Failed,
}

/// Local promotion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promotion {
    pub min_uses: usize,
    pub max_locals: usize,
}

#[derive(Debug)]
struct Unit {
    program: u64,
    range: Range<usize>,
    needs: RangeNeeds,
    /// 1-based source lines of this unit's function.
    lines: Range<usize>,
}

pub struct CompileSession {
    promotion: Option<Promotion>,
    units: Vec<Unit>,
    source: String,
    source_lines: usize,
    module: Option<JITModule>,
    call_conv: String,
    routines: Vec<Arc<CompiledRoutine>>,
    committed: bool,
    failed: bool,
}

impl Drop for CompileSession {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            discard_module(module);
        }
    }
}

impl fmt::Debug for CompileSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileSession")
            .field("state", &self.state())
            .field("units", &self.units.len())
            .field("promotion", &self.promotion)
            .finish_non_exhaustive()
    }
}

impl CompileSession {
    pub fn new(promotion: Option<Promotion>) -> Self {
        CompileSession {
            promotion,
            units: Vec::new(),
            source: String::new(),
            source_lines: 0,
            module: None,
            call_conv: String::new(),
            routines: Vec::new(),
            committed: false,
            failed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.committed {
            SessionState::Committed
        } else if self.failed {
            SessionState::Failed
        } else if self.units.is_empty() {
            SessionState::Empty
        } else {
            SessionState::Collecting
        }
    }

    /// The CLIF text of every registered unit.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Adds `code[range]` to the batch and returns its unit number.
    pub fn register(&mut self, program: u64, code: &[Instruction], range: Range<usize>) -> ExecResult<usize> {
        if self.committed {
            return Err(SessionError::AlreadyCommitted.into());
        }
        if self.failed {
            return Err(SessionError::Failed.into());
        }
        let fail = |message: &str| CodegenError {
            backend: BackendKind::Source,
            program,
            start: range.start,
            end: range.end,
            message: message.to_string(),
        };
        let slice = code.get(range.clone()).ok_or_else(|| fail("range outside program"))?;
        if !is_balanced(slice) {
            return Err(fail("unmatched conditionals").into());
        }
        if self.module.is_none() {
            let module = jit_module(BackendKind::Source).map_err(|m| fail(&m))?;
            self.call_conv = module.isa().default_call_conv().to_string();
            self.module = Some(module);
        }

        let plan = match self.promotion {
            Some(p) => liveness::plan(code, range.clone(), p.min_uses, p.max_locals),
            None => LivenessPlan::default(),
        };
        let index = self.units.len();
        let text = emit_function(index, code, range.clone(), &plan, &self.call_conv);
        let first_line = self.source_lines + 1;
        self.source_lines += text.lines().count();
        self.source.push_str(&text);
        let lines = first_line..self.source_lines + 1;
        debug!(unit = index, start = range.start, end = range.end, locals = plan.local_count, "registered");
        self.units.push(Unit { program, needs: RangeNeeds::of(slice), range, lines });
        Ok(index)
    }

    /// Compiles the whole batch. No routine is available before this.
    #[instrument(skip_all, fields(units = self.units.len()))]
    pub fn commit(&mut self) -> ExecResult<()> {
        if self.committed {
            return Err(SessionError::AlreadyCommitted.into());
        }
        if self.failed {
            return Err(SessionError::Failed.into());
        }
        if self.module.is_none() {
            return Err(SessionError::Empty.into());
        }

        // Parsing leaves the module untouched, so a parse error keeps the
        // session collecting.
        let functions = cranelift_reader::parse_functions(&self.source).map_err(|e| {
            let line = e.location.line_number;
            let unit = self.units.iter().find(|u| u.lines.contains(&line)).or(self.units.last());
            self.unit_error(unit, format!("line {line}: {}", e.message))
        })?;
        let Some(mut module) = self.module.take() else {
            return Err(SessionError::Empty.into());
        };

        let mut ids = Vec::with_capacity(functions.len());
        let mut ctx = Context::new();
        let mut defined = Ok(());
        for (i, func) in functions.into_iter().enumerate() {
            let Some(unit) = self.units.get(i) else { break };
            let name = format!("clif_{i}_{}_{}", unit.range.start, unit.range.end);
            let step = module.declare_function(&name, Linkage::Local, &func.signature).and_then(|id| {
                ctx.func = func;
                let result = module.define_function(id, &mut ctx).map(|()| id);
                module.clear_context(&mut ctx);
                result
            });
            match step {
                Ok(id) => ids.push(id),
                Err(e) => {
                    defined = Err(self.unit_error(Some(unit), e.to_string()));
                    break;
                }
            }
        }
        let finalized = defined.and_then(|()| {
            module.finalize_definitions().map_err(|e| self.unit_error(self.units.first(), e.to_string()))
        });
        if let Err(e) = finalized {
            discard_module(module);
            self.failed = true;
            return Err(e.into());
        }

        let entries: Vec<*const u8> = ids.iter().map(|&id| module.get_finalized_function(id)).collect();
        let owner = Arc::new(JitModuleHandle::new(module));
        for (unit, ptr) in self.units.iter().zip(entries) {
            // SAFETY: every unit was emitted as `fn(*mut Frame)`; `owner` keeps
            // the module's code alive as long as any routine does.
            let entry: RoutineFn = unsafe { std::mem::transmute::<*const u8, RoutineFn>(ptr) };
            // SAFETY: the text touches only what `RangeNeeds` counts.
            let routine = unsafe {
                CompiledRoutine::new(BackendKind::Source, unit.range.clone(), unit.needs, entry, owner.clone())
            };
            self.routines.push(Arc::new(routine));
        }
        self.committed = true;
        info!(units = self.units.len(), bytes = self.source.len(), "source batch committed");
        Ok(())
    }

    pub fn routine(&self, unit: usize) -> Result<Arc<CompiledRoutine>, SessionError> {
        if !self.committed {
            return Err(SessionError::NotCommitted);
        }
        self.routines.get(unit).cloned().ok_or(SessionError::UnknownUnit(unit))
    }

    fn unit_error(&self, unit: Option<&Unit>, message: String) -> CodegenError {
        let (program, range) = unit.map_or((0, 0..0), |u| (u.program, u.range.clone()));
        CodegenError { backend: BackendKind::Source, program, start: range.start, end: range.end, message }
    }
}

// ── CLIF text emission ───────────────────────────────────────────────

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

fn f64_literal(v: f64) -> String {
    Ieee64::with_float(v).to_string()
}

/// `base+off` in CLIF address syntax.
fn at(base: &str, off: i32) -> String {
    match off {
        0 => base.to_string(),
        o if o > 0 => format!("{base}+{o}"),
        o => format!("{base}{o}"),
    }
}

/// The values that flow between blocks.
#[derive(Debug, Clone)]
struct Threaded {
    locals: Vec<String>,
    input_cursor: String,
    output_cursor: String,
    flag: String,
}

impl Threaded {
    fn args(&self) -> String {
        let mut all: Vec<&str> = self.locals.iter().map(String::as_str).collect();
        all.extend([self.input_cursor.as_str(), self.output_cursor.as_str(), self.flag.as_str()]);
        all.join(", ")
    }
}

struct Writer<'a> {
    out: String,
    next_value: u32,
    next_block: u32,
    plan: &'a LivenessPlan,
    frame: String,
    scratch: String,
    inputs: String,
    outputs: String,
    state: Threaded,
    merges: Vec<u32>,
}

impl Writer<'_> {
    fn value(&mut self) -> String {
        let v = format!("v{}", self.next_value);
        self.next_value += 1;
        v
    }

    fn block(&mut self) -> u32 {
        let b = self.next_block;
        self.next_block += 1;
        b
    }

    fn line(&mut self, text: &str) {
        indent(&mut self.out, 1);
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn def(&mut self, rhs: &str) -> String {
        let v = self.value();
        self.line(&format!("{v} = {rhs}"));
        v
    }

    /// Base value and offset for element `index` of an f64 array.
    fn element(&mut self, base: &str, index: u32) -> (String, i32) {
        let offset = i64::from(index) * 8;
        match i32::try_from(offset) {
            Ok(off) => (base.to_string(), off),
            Err(_) => (self.def(&format!("iadd_imm {base}, {offset}")), 0),
        }
    }

    fn load_memory(&mut self, slot: u32) -> String {
        let scratch = self.scratch.clone();
        let (base, off) = self.element(&scratch, slot);
        self.def(&format!("load.f64 notrap aligned {}", at(&base, off)))
    }

    fn store_memory(&mut self, slot: u32, v: &str) {
        let scratch = self.scratch.clone();
        let (base, off) = self.element(&scratch, slot);
        self.line(&format!("store notrap aligned {v}, {}", at(&base, off)));
    }

    fn read(&mut self, slot: u32) -> String {
        match self.plan.local_of(slot) {
            Some(local) => self.state.locals[local as usize].clone(),
            None => self.load_memory(slot),
        }
    }

    fn write(&mut self, slot: u32, v: String) {
        match self.plan.local_of(slot) {
            Some(local) => self.state.locals[local as usize] = v,
            None => self.store_memory(slot, &v),
        }
    }

    /// Address of the cursor's element, advancing the cursor.
    fn stream(&mut self, base: &str, output: bool) -> String {
        let cursor = if output { self.state.output_cursor.clone() } else { self.state.input_cursor.clone() };
        let bytes = self.def(&format!("ishl_imm {cursor}, 3"));
        let addr = self.def(&format!("iadd {base}, {bytes}"));
        let next = self.def(&format!("iadd_imm {cursor}, 1"));
        if output {
            self.state.output_cursor = next;
        } else {
            self.state.input_cursor = next;
        }
        addr
    }

    fn compare(&mut self, cc: &str, inst: &Instruction, literal: bool) {
        let a = self.read(inst.index);
        let b = if literal {
            self.def(&format!("f64const {}", f64_literal(inst.literal())))
        } else {
            self.read(inst.source)
        };
        self.state.flag = self.def(&format!("fcmp {cc} {a}, {b}"));
    }

    fn instruction(&mut self, inst: &Instruction) {
        match inst.op {
            Opcode::Zero => {
                let z = self.def(&format!("f64const {}", f64_literal(0.0)));
                self.write(inst.index, z);
            }
            Opcode::Copy => {
                let v = self.read(inst.source);
                self.write(inst.index, v);
            }
            Opcode::NextInput => {
                let inputs = self.inputs.clone();
                let addr = self.stream(&inputs, false);
                let v = self.def(&format!("load.f64 notrap aligned {addr}"));
                self.write(inst.index, v);
            }
            Opcode::NextOutput => {
                let v = self.read(inst.source);
                let outputs = self.outputs.clone();
                let addr = self.stream(&outputs, true);
                self.line(&format!("store notrap aligned {v}, {addr}"));
            }
            Opcode::AccumulateOutput => {
                let v = self.read(inst.source);
                let outputs = self.outputs.clone();
                let (base, off) = self.element(&outputs, inst.index);
                let old = self.def(&format!("load.f64 notrap aligned {}", at(&base, off)));
                let sum = self.def(&format!("fadd {old}, {v}"));
                self.line(&format!("store notrap aligned {sum}, {}", at(&base, off)));
            }
            Opcode::MultiplyBy | Opcode::IncrementBy | Opcode::DecrementBy => {
                let a = self.read(inst.index);
                let s = self.read(inst.source);
                let op = match inst.op {
                    Opcode::MultiplyBy => "fmul",
                    Opcode::IncrementBy => "fadd",
                    _ => "fsub",
                };
                let r = self.def(&format!("{op} {a}, {s}"));
                self.write(inst.index, r);
            }
            Opcode::Equals => self.compare("eq", inst, false),
            Opcode::NotEquals => self.compare("ne", inst, false),
            Opcode::GreaterThan => self.compare("gt", inst, false),
            Opcode::LessThan => self.compare("lt", inst, false),
            Opcode::EqualsValue => self.compare("eq", inst, true),
            Opcode::NotEqualsValue => self.compare("ne", inst, true),
            Opcode::If => {
                let body = self.block();
                let merge = self.block();
                let args = self.state.args();
                self.line(&format!("brif {}, block{body}, block{merge}({args})", self.state.flag));
                self.out.push_str(&format!("block{body}:\n"));
                self.merges.push(merge);
            }
            Opcode::EndIf => {
                let Some(merge) = self.merges.pop() else { return };
                let args = self.state.args();
                self.line(&format!("jump block{merge}({args})"));
                let mut params = Vec::new();
                let mut locals = Vec::with_capacity(self.state.locals.len());
                for _ in 0..self.state.locals.len() {
                    let v = self.value();
                    params.push(format!("{v}: f64"));
                    locals.push(v);
                }
                let input_cursor = self.value();
                let output_cursor = self.value();
                let flag = self.value();
                params.push(format!("{input_cursor}: i64"));
                params.push(format!("{output_cursor}: i64"));
                params.push(format!("{flag}: i8"));
                self.out.push_str(&format!("block{merge}({}):\n", params.join(", ")));
                self.state = Threaded { locals, input_cursor, output_cursor, flag };
            }
            Opcode::Blank | Opcode::Comment => {}
        }
    }
}

/// Emits `code[range]` as CLIF function `u0:{index}`.
pub fn emit_function(index: usize, code: &[Instruction], range: Range<usize>, plan: &LivenessPlan, call_conv: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("function u0:{index}(i64) {call_conv} {{\n"));
    out.push_str("block0(v0: i64):\n");
    let mut w = Writer {
        out,
        next_value: 1,
        next_block: 1,
        plan,
        frame: "v0".to_string(),
        scratch: String::new(),
        inputs: String::new(),
        outputs: String::new(),
        state: Threaded { locals: Vec::new(), input_cursor: String::new(), output_cursor: String::new(), flag: String::new() },
        merges: Vec::new(),
    };
    let frame = w.frame.clone();
    w.scratch = w.def(&format!("load.i64 notrap aligned {}", at(&frame, FRAME_SCRATCH)));
    w.inputs = w.def(&format!("load.i64 notrap aligned {}", at(&frame, FRAME_INPUTS)));
    w.outputs = w.def(&format!("load.i64 notrap aligned {}", at(&frame, FRAME_OUTPUTS)));
    w.state.input_cursor = w.def(&format!("load.i64 notrap aligned {}", at(&frame, FRAME_INPUT_CURSOR)));
    w.state.output_cursor = w.def(&format!("load.i64 notrap aligned {}", at(&frame, FRAME_OUTPUT_CURSOR)));
    w.state.flag = w.def(&format!("load.i8 notrap aligned {}", at(&frame, FRAME_FLAG)));
    if plan.local_count > 0 {
        let zero = w.def(&format!("f64const {}", f64_literal(0.0)));
        w.state.locals = vec![zero; plan.local_count as usize];
    }

    for pos in range {
        for p in plan.starting_at(pos) {
            let v = w.load_memory(p.slot);
            w.state.locals[p.local as usize] = v;
        }
        w.instruction(&code[pos]);
        for p in plan.ending_at(pos).filter(|p| p.written) {
            let v = w.state.locals[p.local as usize].clone();
            w.store_memory(p.slot, &v);
        }
    }

    let s = w.state.clone();
    w.line(&format!("store notrap aligned {}, {}", s.input_cursor, at(&frame, FRAME_INPUT_CURSOR)));
    w.line(&format!("store notrap aligned {}, {}", s.output_cursor, at(&frame, FRAME_OUTPUT_CURSOR)));
    w.line(&format!("store notrap aligned {}, {}", s.flag, at(&frame, FRAME_FLAG)));
    w.line("return");
    w.out.push_str("}\n\n");
    w.out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::interp::execute_range;
    use crate::backend::ExecState;
    use crate::testing::{assert_same_slots, random_code};

    const PROMOTE: Option<Promotion> = Some(Promotion { min_uses: 2, max_locals: 4 });

    fn sample() -> Vec<Instruction> {
        vec![
            Instruction::unary(Opcode::NextInput, 0),
            Instruction::new(Opcode::IncrementBy, 1, 0),
            Instruction::new(Opcode::GreaterThan, 1, 0),
            Instruction::marker(Opcode::If),
            Instruction::new(Opcode::MultiplyBy, 1, 1),
            Instruction::new(Opcode::NextOutput, 0, 1),
            Instruction::marker(Opcode::EndIf),
            Instruction::new(Opcode::IncrementBy, 1, 0),
            Instruction::new(Opcode::AccumulateOutput, 0, 1),
        ]
    }

    fn check_against_interpreter(code: &[Instruction], promotion: Option<Promotion>, scratch: &[f64], inputs: &[f64]) {
        let mut session = CompileSession::new(promotion);
        let unit = session.register(1, code, 0..code.len()).unwrap();
        session.commit().unwrap();
        let routine = session.routine(unit).unwrap();

        let mut s1 = scratch.to_vec();
        let mut o1 = vec![0.0; 2];
        let mut st1 = ExecState::new(&mut s1, inputs, &mut o1);
        execute_range(code, 0..code.len(), &mut st1).unwrap();
        let c1 = (st1.input_cursor, st1.output_cursor, st1.flag);

        let mut s2 = scratch.to_vec();
        let mut o2 = vec![0.0; 2];
        let mut st2 = ExecState::new(&mut s2, inputs, &mut o2);
        routine.execute(&mut st2).unwrap();
        let c2 = (st2.input_cursor, st2.output_cursor, st2.flag);

        assert_eq!(c1, c2, "{}", session.source());
        assert_same_slots(&s1, &s2);
        assert_same_slots(&o1, &o2);
    }

    #[test]
    fn text_threads_promoted_locals_through_merge() {
        let code = sample();
        let plan = liveness::plan(&code, 0..code.len(), 2, 4);
        assert!(plan.local_of(1).is_some());
        let text = emit_function(0, &code, 0..code.len(), &plan, "system_v");
        assert!(text.starts_with("function u0:0(i64) system_v {"));
        assert!(text.contains("brif"));
        assert!(text.contains(": f64, "));
        assert!(cranelift_reader::parse_functions(&text).is_ok(), "{text}");
    }

    #[test]
    fn matches_interpreter_with_and_without_promotion() {
        for promotion in [None, PROMOTE] {
            check_against_interpreter(&sample(), promotion, &[0.0, 1.0], &[2.0]);
            check_against_interpreter(&sample(), promotion, &[0.0, -5.0], &[2.0]);
        }
    }

    #[test]
    fn random_ranges_match_interpreter() {
        let mut rng = fastrand::Rng::with_seed(0xc11f);
        for _ in 0..25 {
            let code = random_code(&mut rng, 60, 6);
            let scratch: Vec<f64> = (0..6).map(|_| f64::from(rng.i8(-3..4))).collect();
            for promotion in [None, Some(Promotion { min_uses: 0, max_locals: 3 })] {
                check_against_interpreter(&code, promotion, &scratch, &[]);
            }
        }
    }

    #[test]
    fn session_state_machine() {
        let code = sample();
        let mut session = CompileSession::new(None);
        assert_eq!(session.state(), SessionState::Empty);
        assert!(matches!(session.commit(), Err(crate::ExecError::Session(SessionError::Empty))));

        let a = session.register(0, &code, 0..3).unwrap();
        let b = session.register(0, &code, 3..7).unwrap();
        assert_eq!(session.state(), SessionState::Collecting);
        assert_eq!(session.routine(a).unwrap_err(), SessionError::NotCommitted);

        session.commit().unwrap();
        assert_eq!(session.state(), SessionState::Committed);
        assert!(session.routine(b).is_ok());
        assert_eq!(session.routine(9).unwrap_err(), SessionError::UnknownUnit(9));
        assert!(matches!(
            session.register(0, &code, 0..3),
            Err(crate::ExecError::Session(SessionError::AlreadyCommitted))
        ));
    }

    #[test]
    fn parse_error_keeps_session_collecting() {
        let code = sample();
        let mut session = CompileSession::new(None);
        session.register(3, &code, 0..3).unwrap();
        let unit = session.register(7, &code, 3..7).unwrap();
        session.source.push_str("function u0:9(i64) system_v {\nblock0(v0: i64):\n    bogus v0\n}\n");
        session.source_lines += 4;
        session.units[unit].lines.end = session.source_lines + 1;

        for _ in 0..2 {
            let err = session.commit().unwrap_err();
            assert!(matches!(err, crate::ExecError::Codegen(CodegenError { program: 7, start: 3, end: 7, .. })), "{err}");
            assert_eq!(session.state(), SessionState::Collecting);
        }
    }

    #[test]
    fn line_ranges_track_each_unit() {
        let code = sample();
        let mut session = CompileSession::new(PROMOTE);
        session.register(0, &code, 0..3).unwrap();
        session.register(0, &code, 3..9).unwrap();
        assert_eq!(session.source_lines, session.source.lines().count());
        assert_eq!(session.units[0].lines.start, 1);
        assert_eq!(session.units[1].lines.start, session.units[0].lines.end);
    }

    #[test]
    fn unbalanced_unit_rejected_with_range() {
        let code = sample();
        let mut session = CompileSession::new(None);
        let err = session.register(42, &code, 0..4).unwrap_err();
        assert!(matches!(err, crate::ExecError::Codegen(CodegenError { program: 42, start: 0, end: 4, .. })));
    }
}

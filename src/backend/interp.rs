//! Dispatch-loop interpreter: the reference every other backend must match.

use std::ops::Range;
use std::sync::Arc;

use super::{Backend, ExecError, ExecResult, ExecState, Routine};
use crate::command::{Instruction, Opcode};
use crate::config::BackendKind;
use crate::program::Program;

#[derive(Debug, Default)]
pub struct Interpreter {
    routines: Vec<Arc<dyn Routine>>,
}

impl Backend for Interpreter {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    fn prepare(&mut self, program: &Program, range: Range<usize>) -> ExecResult<()> {
        let routine = InterpretedRoutine::new(program.shared_code(), range)?;
        self.routines.push(Arc::new(routine));
        Ok(())
    }

    fn finish(self: Box<Self>) -> ExecResult<Vec<Arc<dyn Routine>>> {
        Ok(self.routines)
    }
}

/// A range plus the `If → EndIf` jump table for it.
#[derive(Debug, Clone)]
pub struct InterpretedRoutine {
    code: Arc<[Instruction]>,
    range: Range<usize>,
    jumps: Vec<usize>,
}

impl InterpretedRoutine {
    pub fn new(code: Arc<[Instruction]>, range: Range<usize>) -> ExecResult<Self> {
        let jumps = jump_table(&code, range.clone())?;
        Ok(InterpretedRoutine { code, range, jumps })
    }
}

impl Routine for InterpretedRoutine {
    fn kind(&self) -> BackendKind {
        BackendKind::Interpreter
    }

    fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    fn execute(&self, state: &mut ExecState<'_>) -> ExecResult<()> {
        run(&self.code, self.range.clone(), &self.jumps, state)
    }
}

/// For every `If` in the range, the position of its `EndIf`.
fn jump_table(code: &[Instruction], range: Range<usize>) -> ExecResult<Vec<usize>> {
    let unbalanced = || ExecError::UnbalancedRange { start: range.start, end: range.end };
    let slice = code.get(range.clone()).ok_or_else(unbalanced)?;
    let mut jumps = vec![0; slice.len()];
    let mut open = Vec::new();
    for (offset, inst) in slice.iter().enumerate() {
        match inst.op {
            Opcode::If => open.push(offset),
            Opcode::EndIf => {
                let guard = open.pop().ok_or_else(unbalanced)?;
                jumps[guard] = range.start + offset;
            }
            _ => {}
        }
    }
    if !open.is_empty() {
        return Err(unbalanced());
    }
    Ok(jumps)
}

/// Interprets `code[range]` once; a convenience for callers without a
/// prepared routine.
pub fn execute_range(code: &[Instruction], range: Range<usize>, state: &mut ExecState<'_>) -> ExecResult<()> {
    let jumps = jump_table(code, range.clone())?;
    run(code, range, &jumps, state)
}

fn read(scratch: &[f64], slot: u32) -> ExecResult<f64> {
    scratch
        .get(slot as usize)
        .copied()
        .ok_or(ExecError::ScratchTooSmall { len: scratch.len(), slot: slot as usize })
}

fn write(scratch: &mut [f64], slot: u32) -> ExecResult<&mut f64> {
    let len = scratch.len();
    scratch.get_mut(slot as usize).ok_or(ExecError::ScratchTooSmall { len, slot: slot as usize })
}

fn run(code: &[Instruction], range: Range<usize>, jumps: &[usize], state: &mut ExecState<'_>) -> ExecResult<()> {
    let mut pc = range.start;
    while pc < range.end {
        let inst = code[pc];
        match inst.op {
            Opcode::Zero => *write(state.scratch, inst.index)? = 0.0,
            Opcode::Copy => {
                let v = read(state.scratch, inst.source)?;
                *write(state.scratch, inst.index)? = v;
            }
            Opcode::NextInput => {
                let cursor = state.input_cursor;
                let v = *state.inputs.get(cursor).ok_or(ExecError::InputExhausted {
                    cursor,
                    needed: 1,
                    len: state.inputs.len(),
                })?;
                *write(state.scratch, inst.index)? = v;
                state.input_cursor += 1;
            }
            Opcode::NextOutput => {
                let v = read(state.scratch, inst.source)?;
                let cursor = state.output_cursor;
                let len = state.outputs.len();
                *state.outputs.get_mut(cursor).ok_or(ExecError::OutputOverflow { cursor, needed: 1, len })? = v;
                state.output_cursor += 1;
            }
            Opcode::AccumulateOutput => {
                let v = read(state.scratch, inst.source)?;
                let index = inst.index as usize;
                let len = state.outputs.len();
                *state.outputs.get_mut(index).ok_or(ExecError::AccumulateOutOfRange { index, len })? += v;
            }
            Opcode::MultiplyBy => {
                let v = read(state.scratch, inst.source)?;
                *write(state.scratch, inst.index)? *= v;
            }
            Opcode::IncrementBy => {
                let v = read(state.scratch, inst.source)?;
                *write(state.scratch, inst.index)? += v;
            }
            Opcode::DecrementBy => {
                let v = read(state.scratch, inst.source)?;
                *write(state.scratch, inst.index)? -= v;
            }
            Opcode::Equals => state.flag = read(state.scratch, inst.index)? == read(state.scratch, inst.source)?,
            Opcode::NotEquals => state.flag = read(state.scratch, inst.index)? != read(state.scratch, inst.source)?,
            Opcode::GreaterThan => state.flag = read(state.scratch, inst.index)? > read(state.scratch, inst.source)?,
            Opcode::LessThan => state.flag = read(state.scratch, inst.index)? < read(state.scratch, inst.source)?,
            Opcode::EqualsValue => state.flag = read(state.scratch, inst.index)? == inst.literal(),
            Opcode::NotEqualsValue => state.flag = read(state.scratch, inst.index)? != inst.literal(),
            Opcode::If => {
                if !state.flag {
                    // skipped bodies move neither cursor
                    pc = jumps[pc - range.start] + 1;
                    continue;
                }
            }
            Opcode::EndIf | Opcode::Blank | Opcode::Comment => {}
        }
        pc += 1;
    }
    Ok(())
}

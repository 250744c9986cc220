//! The flat instruction set every backend executes.
//!
//! An instruction is `{op, index, source}`: `index` is usually the slot being
//! written (or compared), `source` the second operand. Literal comparisons
//! and comments reuse `source` as an integer payload.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Opcodes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // data motion
    Zero,
    Copy,
    NextInput,
    NextOutput,
    AccumulateOutput,
    // arithmetic: s[index] = s[index] op s[source]
    MultiplyBy,
    IncrementBy,
    DecrementBy,
    // comparison: sets the ambient branch flag
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    EqualsValue,
    NotEqualsValue,
    // control
    If,
    EndIf,
    // bookkeeping
    Blank,
    Comment,
}

impl Opcode {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Opcode::Equals
                | Opcode::NotEquals
                | Opcode::GreaterThan
                | Opcode::LessThan
                | Opcode::EqualsValue
                | Opcode::NotEqualsValue
        )
    }

    /// True for instructions that move an external-stream cursor.
    pub fn is_stream(self) -> bool {
        matches!(self, Opcode::NextInput | Opcode::NextOutput)
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Zero => "zero",
            Opcode::Copy => "copy",
            Opcode::NextInput => "next_in",
            Opcode::NextOutput => "next_out",
            Opcode::AccumulateOutput => "acc_out",
            Opcode::MultiplyBy => "mul",
            Opcode::IncrementBy => "inc",
            Opcode::DecrementBy => "dec",
            Opcode::Equals => "eq",
            Opcode::NotEquals => "ne",
            Opcode::GreaterThan => "gt",
            Opcode::LessThan => "lt",
            Opcode::EqualsValue => "eq_k",
            Opcode::NotEqualsValue => "ne_k",
            Opcode::If => "if",
            Opcode::EndIf => "endif",
            Opcode::Blank => "blank",
            Opcode::Comment => "comment",
        }
    }
}

// ── Instruction ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    pub index: u32,
    pub source: u32,
}

impl Instruction {
    pub const fn new(op: Opcode, index: u32, source: u32) -> Self {
        Instruction { op, index, source }
    }

    pub const fn unary(op: Opcode, index: u32) -> Self {
        Instruction { op, index, source: 0 }
    }

    pub const fn marker(op: Opcode) -> Self {
        Instruction { op, index: 0, source: 0 }
    }

    /// A literal comparison; the signed value is stored bit for bit in
    /// `source`.
    pub const fn with_literal(op: Opcode, index: u32, value: i32) -> Self {
        Instruction { op, index, source: value as u32 }
    }

    /// The literal operand of `EqualsValue`/`NotEqualsValue`.
    pub fn literal(&self) -> f64 {
        f64::from(self.source as i32)
    }

    /// Scratch slots this instruction reads.
    pub fn read_slots(&self) -> [Option<u32>; 2] {
        match self.op {
            Opcode::Copy | Opcode::NextOutput | Opcode::AccumulateOutput => [Some(self.source), None],
            Opcode::MultiplyBy
            | Opcode::IncrementBy
            | Opcode::DecrementBy
            | Opcode::Equals
            | Opcode::NotEquals
            | Opcode::GreaterThan
            | Opcode::LessThan => [Some(self.index), Some(self.source)],
            Opcode::EqualsValue | Opcode::NotEqualsValue => [Some(self.index), None],
            Opcode::Zero
            | Opcode::NextInput
            | Opcode::If
            | Opcode::EndIf
            | Opcode::Blank
            | Opcode::Comment => [None, None],
        }
    }

    /// The scratch slot this instruction writes, if any.
    pub fn written_slot(&self) -> Option<u32> {
        match self.op {
            Opcode::Zero
            | Opcode::Copy
            | Opcode::NextInput
            | Opcode::MultiplyBy
            | Opcode::IncrementBy
            | Opcode::DecrementBy => Some(self.index),
            _ => None,
        }
    }

    /// Highest scratch slot touched, used for pre-run bounds checks.
    pub fn max_slot(&self) -> Option<u32> {
        let [a, b] = self.read_slots();
        [a, b, self.written_slot()].into_iter().flatten().max()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.op.mnemonic();
        match self.op {
            Opcode::If | Opcode::EndIf | Opcode::Blank => write!(f, "{m}"),
            Opcode::Comment => write!(f, "{m} #{}", self.source),
            Opcode::Zero | Opcode::NextInput => write!(f, "{m} s{}", self.index),
            Opcode::NextOutput => write!(f, "{m} s{}", self.source),
            Opcode::AccumulateOutput => write!(f, "{m} o{} s{}", self.index, self.source),
            Opcode::EqualsValue | Opcode::NotEqualsValue => write!(f, "{m} s{} {}", self.index, self.source as i32),
            _ => write!(f, "{m} s{} s{}", self.index, self.source),
        }
    }
}

// ── Range helpers ────────────────────────────────────────────────────

/// Finds the `EndIf` matching the `If` at `if_pos`, searching below `end`.
pub fn matching_end_if(code: &[Instruction], if_pos: usize, end: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (pos, inst) in code.iter().enumerate().take(end).skip(if_pos) {
        match inst.op {
            Opcode::If => depth += 1,
            Opcode::EndIf => {
                if depth <= 1 {
                    return (depth == 1).then_some(pos);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// True if every `If` in the range has its `EndIf` inside the same range.
pub fn is_balanced(code: &[Instruction]) -> bool {
    let mut depth = 0isize;
    for inst in code {
        match inst.op {
            Opcode::If => depth += 1,
            Opcode::EndIf => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Static stream use of a range: instructions that would consume an input or
/// produce an output if every branch were taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCounts {
    pub inputs: usize,
    pub outputs: usize,
}

impl StreamCounts {
    pub fn of(code: &[Instruction]) -> Self {
        let mut counts = StreamCounts::default();
        for inst in code {
            match inst.op {
                Opcode::NextInput => counts.inputs += 1,
                Opcode::NextOutput => counts.outputs += 1,
                _ => {}
            }
        }
        counts
    }

    pub fn add(self, other: StreamCounts) -> Self {
        StreamCounts { inputs: self.inputs + other.inputs, outputs: self.outputs + other.outputs }
    }
}

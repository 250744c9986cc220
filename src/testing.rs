//! Random program generators for property tests.

use crate::builder::{Builder, Slot};
use crate::command::{Instruction, Opcode};
use crate::config::EngineConfig;
use crate::program::Program;

/// Balanced scratch-only code over `slots` slots.
pub(crate) fn random_code(rng: &mut fastrand::Rng, len: usize, slots: u32) -> Vec<Instruction> {
    let mut code = Vec::with_capacity(len + 4);
    let mut depth = 0;
    while code.len() < len {
        let a = rng.u32(0..slots);
        let s = rng.u32(0..slots);
        match rng.u8(0..12) {
            0 if depth < 3 => {
                let cmp = [Opcode::Equals, Opcode::NotEquals, Opcode::GreaterThan, Opcode::LessThan][rng.usize(0..4)];
                code.push(Instruction::new(cmp, a, s));
                code.push(Instruction::marker(Opcode::If));
                depth += 1;
            }
            1 if depth > 0 => {
                code.push(Instruction::marker(Opcode::EndIf));
                depth -= 1;
            }
            2 => code.push(Instruction::with_literal(Opcode::EqualsValue, a, rng.i32(-2..3))),
            3 => code.push(Instruction::unary(Opcode::Zero, a)),
            _ => {
                let op = [Opcode::Copy, Opcode::IncrementBy, Opcode::DecrementBy, Opcode::MultiplyBy][rng.usize(0..4)];
                code.push(Instruction::new(op, a, s));
            }
        }
    }
    code.extend(std::iter::repeat_n(Instruction::marker(Opcode::EndIf), depth));
    code
}

fn pick(rng: &mut fastrand::Rng, slots: &[Slot]) -> Slot {
    slots[rng.usize(0..slots.len())]
}

/// A builder-made program with streams, nested conditionals and chunks.
pub(crate) fn random_program(rng: &mut fastrand::Rng, len: usize, config: &EngineConfig) -> Program {
    let mut b = Builder::new();
    let mut slots: Vec<Slot> = Vec::new();
    let mut next_source = 0;
    for _ in 0..3 {
        slots.push(b.copy_from_input(next_source).unwrap());
        next_source += 1;
    }
    let mut depth = 0usize;
    let mut open = 0usize;
    let mut destinations = 0usize;
    while b.position() < len {
        let (a, s) = (pick(rng, &slots), pick(rng, &slots));
        match rng.u8(0..18) {
            0 if depth < 3 => {
                match rng.u8(0..4) {
                    0 => b.equals(a, s).unwrap(),
                    1 => b.greater_than(a, s).unwrap(),
                    2 => b.less_than(a, s).unwrap(),
                    _ => b.equals_value(a, rng.i32(-2..3)).unwrap(),
                }
                b.begin_if().unwrap();
                depth += 1;
            }
            1 if depth > 0 => {
                b.end_if().unwrap();
                depth -= 1;
            }
            2 if depth == 0 && open < 3 => {
                b.open_chunk(&format!("c{}", b.position())).unwrap();
                open += 1;
            }
            3 if depth == 0 && open > 0 => {
                b.close_chunk().unwrap();
                open -= 1;
            }
            4 => {
                slots.push(b.copy_from_input(next_source).unwrap());
                next_source += 1;
            }
            5 => {
                b.copy_to_output(a, destinations).unwrap();
                destinations += 1;
            }
            6 => b.accumulate_to_output(a, rng.usize(0..destinations.max(1))).unwrap(),
            7 => slots.push(b.copy_to_new(a).unwrap()),
            8 => slots.push(b.increment_by_product(a, s, pick(rng, &slots)).unwrap()),
            9 => b.not_equals(a, s).unwrap(),
            10 => b.zero(a).unwrap(),
            11 => b.copy(a, s).unwrap(),
            12 => b.multiply(a, s).unwrap(),
            13 => b.decrement(a, s).unwrap(),
            14 => b.comment("step").unwrap(),
            _ => b.increment(a, s).unwrap(),
        }
    }
    for _ in 0..depth {
        b.end_if().unwrap();
    }
    for _ in 0..open {
        b.close_chunk().unwrap();
    }
    b.finish(config).unwrap()
}

pub(crate) fn random_inputs(rng: &mut fastrand::Rng, n: usize) -> Vec<f64> {
    (0..n).map(|_| f64::from(rng.i8(-2..3))).collect()
}

/// Bit-identical, or both NaN.
pub(crate) fn same_f64(a: f64, b: f64) -> bool {
    a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
}

pub(crate) fn assert_same_slots(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len());
    for (i, (&x, &y)) in a.iter().zip(b).enumerate() {
        assert!(same_f64(x, y), "slot {i}: {x} vs {y}");
    }
}

//! Liveness planner: picks hot slots of a range and assigns them locals.
//!
//! A slot's interval is `[first, last]` over its uses, widened so both ends
//! sit at the same conditional nesting level inside the same block. A local
//! loaded at `first` and stored after `last` then executes on every path
//! that touches the slot.

use std::ops::Range;

use serde::Serialize;
use tracing::trace;

use crate::command::{matching_end_if, Instruction, Opcode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Promotion {
    pub slot: u32,
    pub local: u32,
    pub first: usize,
    pub last: usize,
    pub uses: usize,
    /// Whether the range writes the slot; read-only locals skip the store.
    pub written: bool,
}

impl Promotion {
    fn overlaps(&self, first: usize, last: usize) -> bool {
        self.first <= last && first <= self.last
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LivenessPlan {
    /// Ordered by `(first, slot)`.
    pub promotions: Vec<Promotion>,
    pub local_count: u32,
}

impl LivenessPlan {
    pub fn is_empty(&self) -> bool {
        self.promotions.is_empty()
    }

    pub fn promotion(&self, slot: u32) -> Option<&Promotion> {
        self.promotions.iter().find(|p| p.slot == slot)
    }

    pub fn local_of(&self, slot: u32) -> Option<u32> {
        self.promotion(slot).map(|p| p.local)
    }

    pub fn starting_at(&self, pos: usize) -> impl Iterator<Item = &Promotion> {
        self.promotions.iter().filter(move |p| p.first == pos)
    }

    pub fn ending_at(&self, pos: usize) -> impl Iterator<Item = &Promotion> {
        self.promotions.iter().filter(move |p| p.last == pos)
    }
}

#[derive(Debug, Clone, Copy)]
struct Usage {
    uses: usize,
    first: usize,
    last: usize,
    written: bool,
}

/// Plans locals for `code[range]`. `min_uses == 0` qualifies every slot the
/// range touches; at most `max_locals` distinct locals are handed out.
pub fn plan(code: &[Instruction], range: Range<usize>, min_uses: usize, max_locals: usize) -> LivenessPlan {
    let end = range.end.min(code.len());
    if range.start >= end || max_locals == 0 {
        return LivenessPlan::default();
    }
    let start = range.start;

    let mut usage: Vec<Option<Usage>> = Vec::new();
    for (pos, inst) in code.iter().enumerate().take(end).skip(start) {
        let [a, b] = inst.read_slots();
        for (slot, write) in [(a, false), (b, false), (inst.written_slot(), true)] {
            let Some(slot) = slot else { continue };
            let slot = slot as usize;
            if usage.len() <= slot {
                usage.resize(slot + 1, None);
            }
            let entry = usage[slot].get_or_insert(Usage { uses: 0, first: pos, last: pos, written: false });
            entry.uses += 1;
            entry.last = pos;
            entry.written |= write;
        }
    }

    let nesting = Nesting::of(code, start, end);
    let mut candidates: Vec<(u32, Usage)> = usage
        .iter()
        .enumerate()
        .filter_map(|(slot, u)| u.filter(|u| u.uses >= min_uses).map(|u| (slot as u32, u)))
        .collect();
    candidates.sort_by(|(sa, a), (sb, b)| b.uses.cmp(&a.uses).then(sa.cmp(sb)));

    let mut promotions: Vec<Promotion> = Vec::new();
    let mut local_count = 0u32;
    for (slot, u) in candidates {
        let (first, last) = nesting.widen(u.first, u.last);
        let free = (0..local_count).find(|&local| {
            !promotions.iter().any(|p| p.local == local && p.overlaps(first, last))
        });
        let local = match free {
            Some(local) => local,
            None if (local_count as usize) < max_locals => {
                local_count += 1;
                local_count - 1
            }
            None => continue,
        };
        promotions.push(Promotion { slot, local, first, last, uses: u.uses, written: u.written });
    }
    promotions.sort_by_key(|p| (p.first, p.slot));
    trace!(start, end, promoted = promotions.len(), locals = local_count, "liveness plan");
    LivenessPlan { promotions, local_count }
}

/// Conditional structure of a range: the nesting depth of every position and
/// the innermost `If` enclosing it. `If`/`EndIf` belong to the outer level.
struct Nesting {
    start: usize,
    depth: Vec<usize>,
    enclosing: Vec<Option<usize>>,
    end_of: Vec<Option<usize>>,
}

impl Nesting {
    fn of(code: &[Instruction], start: usize, end: usize) -> Self {
        let len = end - start;
        let mut depth = Vec::with_capacity(len);
        let mut enclosing = Vec::with_capacity(len);
        let mut end_of = vec![None; len];
        let mut open: Vec<usize> = Vec::new();
        for pos in start..end {
            match code[pos].op {
                Opcode::If => {
                    depth.push(open.len());
                    enclosing.push(open.last().copied());
                    end_of[pos - start] = matching_end_if(code, pos, end);
                    open.push(pos);
                }
                Opcode::EndIf => {
                    open.pop();
                    depth.push(open.len());
                    enclosing.push(open.last().copied());
                }
                _ => {
                    depth.push(open.len());
                    enclosing.push(open.last().copied());
                }
            }
        }
        Nesting { start, depth, enclosing, end_of }
    }

    fn depth(&self, pos: usize) -> usize {
        self.depth[pos - self.start]
    }

    fn widen(&self, mut first: usize, mut last: usize) -> (usize, usize) {
        let level = (first..=last).map(|p| self.depth(p)).min().unwrap_or(0);
        while self.depth(first) > level {
            match self.enclosing[first - self.start] {
                Some(guard) => first = guard,
                None => break,
            }
        }
        while self.depth(last) > level {
            let end = self.enclosing[last - self.start].and_then(|guard| self.end_of[guard - self.start]);
            match end {
                Some(end) => last = end,
                None => break,
            }
        }
        (first, last)
    }
}

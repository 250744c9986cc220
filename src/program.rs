//! The frozen result of a build.

use std::collections::hash_map::DefaultHasher;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::backend::ExecError;
use crate::command::Instruction;
use crate::tree::{hoist, ChunkKind, ChunkTree};

/// Instructions, the logical chunk tree the builder recorded, and the hoisted
/// tree derived from it. Cloning shares the instructions.
#[derive(Debug, Clone)]
pub struct Program {
    code: Arc<[Instruction]>,
    slot_count: usize,
    ordered_sources: Arc<[usize]>,
    ordered_destinations: Arc<[usize]>,
    comments: Arc<[String]>,
    logical: Arc<ChunkTree>,
    tree: ChunkTree,
    max_chunk_len: usize,
    fingerprint: u64,
}

impl Program {
    pub(crate) fn from_parts(
        code: Vec<Instruction>,
        slot_count: usize,
        ordered_sources: Vec<usize>,
        ordered_destinations: Vec<usize>,
        comments: Vec<String>,
        logical: ChunkTree,
        max_chunk_len: usize,
    ) -> Self {
        let fingerprint = fingerprint(&code, slot_count);
        let tree = hoist(&logical, &code, max_chunk_len);
        Program {
            code: code.into(),
            slot_count,
            ordered_sources: ordered_sources.into(),
            ordered_destinations: ordered_destinations.into(),
            comments: comments.into(),
            logical: Arc::new(logical),
            tree,
            max_chunk_len,
            fingerprint,
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.code
    }

    pub(crate) fn shared_code(&self) -> Arc<[Instruction]> {
        Arc::clone(&self.code)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// External inputs consumed if every branch is taken.
    pub fn input_count(&self) -> usize {
        self.ordered_sources.len()
    }

    pub fn output_count(&self) -> usize {
        self.ordered_destinations.len()
    }

    pub fn ordered_sources(&self) -> &[usize] {
        &self.ordered_sources
    }

    pub fn ordered_destinations(&self) -> &[usize] {
        &self.ordered_destinations
    }

    pub fn comment(&self, index: usize) -> Option<&str> {
        self.comments.get(index).map(String::as_str)
    }

    /// The executable (hoisted) tree.
    pub fn tree(&self) -> &ChunkTree {
        &self.tree
    }

    /// The tree as the builder recorded it, before hoisting.
    pub fn logical_tree(&self) -> &ChunkTree {
        &self.logical
    }

    pub fn max_chunk_len(&self) -> usize {
        self.max_chunk_len
    }

    /// Identifies the instruction stream; equal fingerprints mean compiled
    /// artifacts can be shared.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// The same program hoisted under a different threshold.
    pub fn with_max_chunk_len(&self, max_chunk_len: usize) -> Program {
        Program {
            tree: hoist(&self.logical, &self.code, max_chunk_len),
            max_chunk_len,
            ..self.clone()
        }
    }

    /// Builds the external-input buffer by reading `data` at each recorded
    /// source index, in stream order.
    pub fn gather_inputs(&self, data: &[f64]) -> Result<Vec<f64>, ExecError> {
        self.ordered_sources
            .iter()
            .map(|&i| data.get(i).copied().ok_or(ExecError::SourceOutOfRange { index: i, len: data.len() }))
            .collect()
    }

    /// Adds each produced output into `data` at its recorded destination.
    pub fn scatter_outputs(&self, outputs: &[f64], data: &mut [f64]) -> Result<(), ExecError> {
        let len = data.len();
        for (&dest, &value) in self.ordered_destinations.iter().zip(outputs) {
            let slot = data.get_mut(dest).ok_or(ExecError::SourceOutOfRange { index: dest, len })?;
            *slot += value;
        }
        Ok(())
    }

    /// Human-readable listing with chunk boundaries.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for id in self.tree.leaves() {
            let chunk = self.tree.get(id);
            let _ = writeln!(out, "-- {} [{}..{})", chunk.name, chunk.range.start, chunk.range.end);
            for pos in chunk.range.clone() {
                let inst = &self.code[pos];
                match inst.op {
                    crate::command::Opcode::Comment => {
                        let text = self.comment(inst.source as usize).unwrap_or("");
                        let _ = writeln!(out, "{pos:>6}  # {text}");
                    }
                    _ => {
                        let _ = writeln!(out, "{pos:>6}  {inst}");
                    }
                }
            }
        }
        out
    }

    pub(crate) fn parallel_count(&self) -> usize {
        self.tree.iter().filter(|(_, c)| matches!(c.kind, ChunkKind::Parallel { .. })).count()
    }
}

fn fingerprint(code: &[Instruction], slot_count: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    code.hash(&mut hasher);
    slot_count.hash(&mut hasher);
    hasher.finish()
}

//! Builder: the only way to construct a `Program`.
//!
//! Slots are allocated append-only. Chunks follow a stack discipline; each
//! closed chunk becomes a node of the logical tree under the chunk that was
//! open at the time. Instructions emitted directly into a chunk that also
//! has child chunks become anonymous leaves between those children.

pub mod templates;

use std::collections::HashMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::{Instruction, Opcode, StreamCounts};
use crate::config::{ConfigError, EngineConfig};
use crate::program::Program;
use crate::tree::{Chunk, ChunkId, ChunkKind, ChunkTree};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("slot s{slot} was never allocated ({allocated} slots exist)")]
    UnallocatedSlot { slot: u32, allocated: u32 },
    #[error("{open} conditional(s) still open at finish")]
    UnbalancedConditional { open: usize },
    #[error("end_if at instruction {position} has no matching begin_if")]
    UnmatchedEndIf { position: usize },
    #[error("chunk '{name}' opened or closed inside an open conditional")]
    ChunkInsideConditional { name: String },
    #[error("chunk '{name}' is still open")]
    UnclosedChunk { name: String },
    #[error("no chunk is open")]
    NoOpenChunk,
    #[error("chunk '{name}' must be closed with {expected}")]
    WrongClose { name: String, expected: &'static str },
    #[error("parallel chunk '{name}' may only contain child chunks")]
    InstructionsInParallelChunk { name: String },
    #[error("inside parallel chunk '{name}': {reason}")]
    ParallelStream { name: String, reason: &'static str },
    #[error("replay of '{recorded}' diverges at instruction {position}: expected `{expected}`, got `{found}`")]
    ReplayMismatch { recorded: String, position: usize, expected: String, found: String },
    #[error("chunk '{name}' cannot be replayed: {reason}")]
    NotReplayable { name: String, reason: &'static str },
    #[error("replay of '{name}' still in progress")]
    ReplayInProgress { name: String },
    #[error("cannot open chunk '{name}' while a replay is in progress")]
    NestedReplay { name: String },
    #[error("{open} depth scope(s) left open")]
    UnbalancedDepthScope { open: usize },
    #[error("array length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("unknown chunk id {0}")]
    UnknownChunk(usize),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type BuildResult<T> = Result<T, BuildError>;

/// A scratch slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot(pub u32);

impl Slot {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ── Open-chunk bookkeeping ───────────────────────────────────────────

#[derive(Debug)]
enum OpenKind {
    Sequence,
    Parallel { join: Vec<u32>, scopes_at_open: usize },
    Replay,
}

#[derive(Debug)]
struct OpenChunk {
    name: String,
    start: usize,
    /// Start of the instructions emitted directly into this chunk since its
    /// last child closed.
    segment_start: usize,
    kind: OpenKind,
    children: Vec<ChunkId>,
    slot_floor: u32,
}

#[derive(Debug)]
struct Replay {
    recorded: ChunkId,
    recorded_name: String,
    range: Range<usize>,
    pos: usize,
    resume_slot: u32,
}

// ── Builder ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Builder {
    code: Vec<Instruction>,
    next_slot: u32,
    slot_high_water: u32,
    ordered_sources: Vec<usize>,
    ordered_destinations: Vec<usize>,
    destination_positions: HashMap<usize, usize>,
    /// False once a `NextOutput` was emitted inside a conditional: stream
    /// positions recorded after that point are no longer fixed.
    outputs_aligned: bool,
    comments: Vec<String>,
    tree: ChunkTree,
    slot_floors: HashMap<ChunkId, u32>,
    open: Vec<OpenChunk>,
    cond_depth: usize,
    depth_scopes: usize,
    replay: Option<Replay>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            code: Vec::new(),
            next_slot: 0,
            slot_high_water: 0,
            ordered_sources: Vec::new(),
            ordered_destinations: Vec::new(),
            destination_positions: HashMap::new(),
            outputs_aligned: true,
            comments: Vec::new(),
            tree: ChunkTree::new(),
            slot_floors: HashMap::new(),
            open: vec![OpenChunk {
                name: "root".to_string(),
                start: 0,
                segment_start: 0,
                kind: OpenKind::Sequence,
                children: Vec::new(),
                slot_floor: 0,
            }],
            cond_depth: 0,
            depth_scopes: 0,
            replay: None,
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.code
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_high_water
    }

    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }

    /// A chunk that has already been closed.
    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        (id.index() < self.tree.len()).then(|| self.tree.get(id))
    }

    // ── Slot allocation ──

    pub fn new_slot(&mut self) -> Slot {
        let s = self.next_slot;
        self.next_slot += 1;
        if self.next_slot > self.slot_high_water {
            self.slot_high_water = self.next_slot;
        }
        Slot(s)
    }

    pub fn new_slots(&mut self, n: usize) -> Vec<Slot> {
        (0..n).map(|_| self.new_slot()).collect()
    }

    fn check_slot(&self, slot: u32) -> BuildResult<()> {
        if slot >= self.slot_high_water {
            return Err(BuildError::UnallocatedSlot { slot, allocated: self.slot_high_water });
        }
        Ok(())
    }

    // ── Emission ──

    fn innermost_parallel(&self) -> Option<&OpenChunk> {
        self.open.iter().rev().find(|c| matches!(c.kind, OpenKind::Parallel { .. }))
    }

    fn emit(&mut self, inst: Instruction) -> BuildResult<()> {
        if let Some(slot) = inst.max_slot() {
            self.check_slot(slot)?;
        }
        if let Some(parallel) = self.innermost_parallel() {
            let reason = if inst.op == Opcode::AccumulateOutput {
                Some("reused output destinations are not allowed")
            } else if inst.op.is_stream() && self.cond_depth > 0 {
                Some("external-stream instructions may not be conditional")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(BuildError::ParallelStream { name: parallel.name.clone(), reason });
            }
        }
        match inst.op {
            Opcode::If => self.cond_depth += 1,
            Opcode::EndIf => {
                if self.cond_depth == 0 {
                    return Err(BuildError::UnmatchedEndIf { position: self.code.len() });
                }
                self.cond_depth -= 1;
            }
            _ => {}
        }
        if let Some(replay) = &mut self.replay {
            let expected = self.code.get(replay.pos).filter(|_| replay.pos < replay.range.end);
            if expected != Some(&inst) {
                return Err(BuildError::ReplayMismatch {
                    recorded: replay.recorded_name.clone(),
                    position: replay.pos,
                    expected: expected.map_or_else(|| "end of range".to_string(), |e| e.to_string()),
                    found: inst.to_string(),
                });
            }
            replay.pos += 1;
            return Ok(());
        }
        if let Some(top) = self.open.last() {
            if matches!(top.kind, OpenKind::Parallel { .. }) {
                return Err(BuildError::InstructionsInParallelChunk { name: top.name.clone() });
            }
        }
        self.code.push(inst);
        Ok(())
    }

    /// The instruction a replay expects next, if replaying.
    fn replay_expects(&self) -> Option<Instruction> {
        let replay = self.replay.as_ref()?;
        (replay.pos < replay.range.end).then(|| self.code[replay.pos])
    }

    // ── Data motion ──

    pub fn zero(&mut self, slot: Slot) -> BuildResult<()> {
        self.emit(Instruction::unary(Opcode::Zero, slot.0))
    }

    pub fn new_zero(&mut self) -> BuildResult<Slot> {
        let slot = self.new_slot();
        self.zero(slot)?;
        Ok(slot)
    }

    pub fn copy(&mut self, target: Slot, source: Slot) -> BuildResult<()> {
        self.emit(Instruction::new(Opcode::Copy, target.0, source.0))
    }

    pub fn copy_to_new(&mut self, source: Slot) -> BuildResult<Slot> {
        self.check_slot(source.0)?;
        let slot = self.new_slot();
        self.copy(slot, source)?;
        Ok(slot)
    }

    pub fn copy_array_to_new(&mut self, sources: &[Slot]) -> BuildResult<Vec<Slot>> {
        sources.iter().map(|&s| self.copy_to_new(s)).collect()
    }

    /// Reads the next external input into a new slot. `source_index` is the
    /// position in the caller's data the input is gathered from.
    pub fn copy_from_input(&mut self, source_index: usize) -> BuildResult<Slot> {
        let slot = self.new_slot();
        self.copy_from_input_into(slot, source_index)?;
        Ok(slot)
    }

    pub fn copy_from_input_into(&mut self, target: Slot, source_index: usize) -> BuildResult<()> {
        self.emit(Instruction::unary(Opcode::NextInput, target.0))?;
        self.ordered_sources.push(source_index);
        Ok(())
    }

    /// Writes `slot` to the next external output, destined for
    /// `destination` in the caller's data.
    pub fn copy_to_output(&mut self, slot: Slot, destination: usize) -> BuildResult<()> {
        self.emit(Instruction::new(Opcode::NextOutput, 0, slot.0))?;
        self.record_destination(destination);
        Ok(())
    }

    fn record_destination(&mut self, destination: usize) {
        let position = self.ordered_destinations.len();
        self.ordered_destinations.push(destination);
        if self.cond_depth > 0 {
            self.outputs_aligned = false;
        } else if self.outputs_aligned {
            self.destination_positions.entry(destination).or_insert(position);
        }
    }

    /// Adds `slot` into the output bound for `destination`, reusing that
    /// output's stream position when it is known statically.
    pub fn accumulate_to_output(&mut self, slot: Slot, destination: usize) -> BuildResult<()> {
        let known = self.destination_positions.get(&destination).copied().filter(|_| self.outputs_aligned);
        let reuse = match self.replay_expects() {
            Some(expected) if expected.op == Opcode::NextOutput => None,
            Some(expected) if expected.op == Opcode::AccumulateOutput => known.filter(|&p| p == expected.index as usize),
            _ if self.innermost_parallel().is_some() => None,
            _ => known,
        };
        match reuse {
            Some(position) => self.emit(Instruction::new(Opcode::AccumulateOutput, position as u32, slot.0)),
            None => self.copy_to_output(slot, destination),
        }
    }

    // ── Arithmetic ──

    pub fn increment(&mut self, target: Slot, by: Slot) -> BuildResult<()> {
        self.emit(Instruction::new(Opcode::IncrementBy, target.0, by.0))?;
        self.note_ancestor_write(target);
        Ok(())
    }

    pub fn decrement(&mut self, target: Slot, by: Slot) -> BuildResult<()> {
        self.emit(Instruction::new(Opcode::DecrementBy, target.0, by.0))?;
        self.note_ancestor_write(target);
        Ok(())
    }

    pub fn multiply(&mut self, target: Slot, by: Slot) -> BuildResult<()> {
        self.emit(Instruction::new(Opcode::MultiplyBy, target.0, by.0))
    }

    /// `target += a * b`, through a fresh temporary which is returned.
    pub fn increment_by_product(&mut self, target: Slot, a: Slot, b: Slot) -> BuildResult<Slot> {
        self.check_slot(target.0)?;
        let product = self.copy_to_new(a)?;
        self.multiply(product, b)?;
        self.increment(target, product)?;
        Ok(product)
    }

    pub fn increment_arrays(&mut self, targets: &[Slot], by: &[Slot]) -> BuildResult<()> {
        self.zip_arrays(targets, by, Self::increment)
    }

    pub fn decrement_arrays(&mut self, targets: &[Slot], by: &[Slot]) -> BuildResult<()> {
        self.zip_arrays(targets, by, Self::decrement)
    }

    pub fn multiply_arrays(&mut self, targets: &[Slot], by: &[Slot]) -> BuildResult<()> {
        self.zip_arrays(targets, by, Self::multiply)
    }

    fn zip_arrays(
        &mut self,
        targets: &[Slot],
        by: &[Slot],
        op: fn(&mut Self, Slot, Slot) -> BuildResult<()>,
    ) -> BuildResult<()> {
        if targets.len() != by.len() {
            return Err(BuildError::LengthMismatch { left: targets.len(), right: by.len() });
        }
        for (&t, &b) in targets.iter().zip(by) {
            op(self, t, b)?;
        }
        Ok(())
    }

    /// Inside a depth scope, an increment of a slot owned by an enclosing
    /// chunk is joined back into the parent when the parallel chunk closes.
    /// Every open parallel chunk the slot predates joins it, so nested joins
    /// carry the sum outward one level at a time.
    fn note_ancestor_write(&mut self, target: Slot) {
        let scopes = self.depth_scopes;
        for open in self.open.iter_mut() {
            let floor = open.slot_floor;
            if let OpenKind::Parallel { join, scopes_at_open } = &mut open.kind {
                if scopes > *scopes_at_open && target.0 < floor && !join.contains(&target.0) {
                    join.push(target.0);
                }
            }
        }
    }

    // ── Comparison & control ──

    pub fn equals(&mut self, a: Slot, b: Slot) -> BuildResult<()> {
        self.emit(Instruction::new(Opcode::Equals, a.0, b.0))
    }

    pub fn not_equals(&mut self, a: Slot, b: Slot) -> BuildResult<()> {
        self.emit(Instruction::new(Opcode::NotEquals, a.0, b.0))
    }

    pub fn greater_than(&mut self, a: Slot, b: Slot) -> BuildResult<()> {
        self.emit(Instruction::new(Opcode::GreaterThan, a.0, b.0))
    }

    pub fn less_than(&mut self, a: Slot, b: Slot) -> BuildResult<()> {
        self.emit(Instruction::new(Opcode::LessThan, a.0, b.0))
    }

    pub fn equals_value(&mut self, a: Slot, value: i32) -> BuildResult<()> {
        self.emit(Instruction::with_literal(Opcode::EqualsValue, a.0, value))
    }

    pub fn not_equals_value(&mut self, a: Slot, value: i32) -> BuildResult<()> {
        self.emit(Instruction::with_literal(Opcode::NotEqualsValue, a.0, value))
    }

    pub fn begin_if(&mut self) -> BuildResult<()> {
        self.emit(Instruction::marker(Opcode::If))
    }

    pub fn end_if(&mut self) -> BuildResult<()> {
        self.emit(Instruction::marker(Opcode::EndIf))
    }

    pub fn blank(&mut self) -> BuildResult<()> {
        self.emit(Instruction::marker(Opcode::Blank))
    }

    pub fn comment(&mut self, text: impl Into<String>) -> BuildResult<()> {
        if let Some(expected) = self.replay_expects().filter(|e| e.op == Opcode::Comment) {
            return self.emit(expected);
        }
        let index = self.comments.len() as u32;
        self.emit(Instruction::new(Opcode::Comment, 0, index))?;
        self.comments.push(text.into());
        Ok(())
    }

    // ── Depth scopes ──

    pub fn enter_depth_scope(&mut self) {
        self.depth_scopes += 1;
    }

    pub fn exit_depth_scope(&mut self) -> BuildResult<()> {
        if self.depth_scopes == 0 {
            return Err(BuildError::UnbalancedDepthScope { open: 0 });
        }
        self.depth_scopes -= 1;
        Ok(())
    }

    // ── Chunks ──

    fn check_boundary(&self, name: &str) -> BuildResult<()> {
        if self.cond_depth != 0 {
            return Err(BuildError::ChunkInsideConditional { name: name.to_string() });
        }
        Ok(())
    }

    /// Turns instructions emitted directly into the innermost chunk since its
    /// last boundary into an anonymous leaf.
    fn flush_segment(&mut self) {
        let end = self.code.len();
        let Some(top) = self.open.last() else {
            return;
        };
        if top.segment_start >= end {
            return;
        }
        let range = top.segment_start..end;
        let name = format!("{}#{}", top.name, range.start);
        let floor = top.slot_floor;
        let id = self.push_node(leaf(name, range, None, &self.code));
        self.slot_floors.insert(id, floor);
        self.attach(id);
    }

    /// A chunk with children turns its trailing direct instructions into one
    /// more anonymous leaf; a chunk without children is itself that leaf.
    fn flush_trailing(&mut self) {
        if self.open.last().is_some_and(|c| !c.children.is_empty()) {
            self.flush_segment();
        }
    }

    fn push_node(&mut self, chunk: Chunk) -> ChunkId {
        let id = self.tree.push(chunk);
        self.tree.get_mut(id).origin = id;
        id
    }

    fn push_open(&mut self, name: &str, kind: OpenKind) -> BuildResult<()> {
        if self.replay.is_some() {
            return Err(BuildError::NestedReplay { name: name.to_string() });
        }
        self.check_boundary(name)?;
        self.flush_segment();
        self.open.push(OpenChunk {
            name: name.to_string(),
            start: self.code.len(),
            segment_start: self.code.len(),
            kind,
            children: Vec::new(),
            slot_floor: self.next_slot,
        });
        Ok(())
    }

    pub fn open_chunk(&mut self, name: &str) -> BuildResult<()> {
        self.push_open(name, OpenKind::Sequence)
    }

    /// Opens a chunk whose direct children are independent of each other.
    pub fn open_parallel_chunk(&mut self, name: &str) -> BuildResult<()> {
        let scopes_at_open = self.depth_scopes;
        self.push_open(name, OpenKind::Parallel { join: Vec::new(), scopes_at_open })
    }

    /// Opens a chunk that replays `recorded`: the builder calls made until
    /// `close_chunk` are checked against the recorded instructions instead of
    /// being appended, while stream sources and destinations are recorded.
    pub fn open_identical_chunk(&mut self, name: &str, recorded: ChunkId) -> BuildResult<()> {
        let (range, floor, recorded_name) = self.replayable(recorded)?;
        self.push_open(name, OpenKind::Replay)?;
        self.replay = Some(Replay {
            recorded,
            recorded_name,
            range: range.clone(),
            pos: range.start,
            resume_slot: self.next_slot,
        });
        self.next_slot = floor;
        Ok(())
    }

    /// Records a leaf that reruns `recorded`'s range without re-emitting it.
    /// Only stream-free ranges qualify, since nothing is re-recorded.
    pub fn replay_chunk(&mut self, name: &str, recorded: ChunkId) -> BuildResult<ChunkId> {
        let (range, floor, _) = self.replayable(recorded)?;
        let touches_streams = self.code[range.clone()]
            .iter()
            .any(|i| i.op.is_stream() || i.op == Opcode::AccumulateOutput);
        if touches_streams {
            return Err(BuildError::NotReplayable { name: name.to_string(), reason: "range uses external streams" });
        }
        if self.replay.is_some() {
            return Err(BuildError::NestedReplay { name: name.to_string() });
        }
        self.check_boundary(name)?;
        self.flush_segment();
        let id = self.push_node(leaf(name.to_string(), range.clone(), Some(range.start), &self.code));
        self.slot_floors.insert(id, floor);
        self.attach(id);
        Ok(id)
    }

    fn replayable(&self, recorded: ChunkId) -> BuildResult<(Range<usize>, u32, String)> {
        if recorded.index() >= self.tree.len() {
            return Err(BuildError::UnknownChunk(recorded.index()));
        }
        let chunk = self.tree.get(recorded);
        if !chunk.is_leaf() {
            return Err(BuildError::NotReplayable { name: chunk.name.clone(), reason: "only leaf chunks can be replayed" });
        }
        let floor = self.slot_floors.get(&recorded).copied().unwrap_or(0);
        Ok((chunk.range.clone(), floor, chunk.name.clone()))
    }

    fn attach(&mut self, id: ChunkId) {
        let end = self.code.len();
        if let Some(parent) = self.open.last_mut() {
            parent.children.push(id);
            parent.segment_start = end;
        }
    }

    fn pop_open(&mut self) -> BuildResult<OpenChunk> {
        if self.open.len() <= 1 {
            return Err(BuildError::NoOpenChunk);
        }
        let name = self.open.last().map(|c| c.name.clone()).unwrap_or_default();
        self.check_boundary(&name)?;
        if let Some(OpenKind::Replay) = self.open.last().map(|c| &c.kind) {
            self.flush_replay()?;
        } else {
            self.flush_trailing();
        }
        self.open.pop().ok_or(BuildError::NoOpenChunk)
    }

    fn flush_replay(&mut self) -> BuildResult<()> {
        let Some(replay) = &self.replay else {
            return Ok(());
        };
        if replay.pos != replay.range.end {
            return Err(BuildError::ReplayMismatch {
                recorded: replay.recorded_name.clone(),
                position: replay.pos,
                expected: self.code[replay.pos].to_string(),
                found: "end of chunk".to_string(),
            });
        }
        Ok(())
    }

    pub fn close_chunk(&mut self) -> BuildResult<ChunkId> {
        if let Some(top) = self.open.last() {
            if matches!(top.kind, OpenKind::Parallel { .. }) {
                return Err(BuildError::WrongClose { name: top.name.clone(), expected: "close_parallel_chunk" });
            }
        }
        let chunk = self.pop_open()?;
        let id = match chunk.kind {
            OpenKind::Replay => {
                let replay = self.replay.take().ok_or(BuildError::NoOpenChunk)?;
                self.next_slot = self.next_slot.max(replay.resume_slot);
                let floor = self.slot_floors.get(&replay.recorded).copied().unwrap_or(0);
                let id = self.push_node(leaf(chunk.name, replay.range.clone(), Some(replay.range.start), &self.code));
                self.slot_floors.insert(id, floor);
                id
            }
            _ => {
                let id = self.finish_node(chunk.name, chunk.start, chunk.children, None);
                self.slot_floors.insert(id, chunk.slot_floor);
                id
            }
        };
        self.attach(id);
        Ok(id)
    }

    /// Closes a parallel chunk. `join` lists the slots whose increments the
    /// children contribute back to the parent scratch array.
    pub fn close_parallel_chunk(&mut self, join: &[Slot]) -> BuildResult<ChunkId> {
        for s in join {
            self.check_slot(s.0)?;
        }
        match self.open.last() {
            Some(top) if !matches!(top.kind, OpenKind::Parallel { .. }) => {
                return Err(BuildError::WrongClose { name: top.name.clone(), expected: "close_chunk" });
            }
            Some(OpenChunk { kind: OpenKind::Parallel { scopes_at_open, .. }, .. })
                if *scopes_at_open != self.depth_scopes =>
            {
                return Err(BuildError::UnbalancedDepthScope { open: self.depth_scopes.abs_diff(*scopes_at_open) });
            }
            _ => {}
        }
        let chunk = self.pop_open()?;
        let mut slots: Vec<u32> = join.iter().map(|s| s.0).collect();
        if let OpenKind::Parallel { join: auto, .. } = chunk.kind {
            for s in auto {
                if !slots.contains(&s) {
                    slots.push(s);
                }
            }
        }
        let id = self.finish_node(chunk.name, chunk.start, chunk.children, Some(slots));
        self.slot_floors.insert(id, chunk.slot_floor);
        self.attach(id);
        Ok(id)
    }

    fn finish_node(&mut self, name: String, start: usize, children: Vec<ChunkId>, join: Option<Vec<u32>>) -> ChunkId {
        let end = self.code.len();
        let stream = children.iter().fold(StreamCounts::default(), |acc, &c| acc.add(self.tree.get(c).stream));
        let kind = match join {
            Some(join) => ChunkKind::Parallel { children, join },
            None if children.is_empty() => ChunkKind::Leaf,
            None => ChunkKind::Sequence { children },
        };
        if matches!(kind, ChunkKind::Leaf) {
            return self.push_node(leaf(name, start..end, None, &self.code));
        }
        self.push_node(Chunk {
            name,
            range: start..end,
            kind,
            identical_range_start: None,
            origin: ChunkId(0),
            stream,
        })
    }

    /// Closes the root chunk and hoists the result under `config`.
    pub fn finish(mut self, config: &EngineConfig) -> BuildResult<Program> {
        config.validate()?;
        if let Some(replay) = &self.replay {
            return Err(BuildError::ReplayInProgress { name: replay.recorded_name.clone() });
        }
        if self.open.len() > 1 {
            let name = self.open.last().map(|c| c.name.clone()).unwrap_or_default();
            return Err(BuildError::UnclosedChunk { name });
        }
        if self.cond_depth != 0 {
            return Err(BuildError::UnbalancedConditional { open: self.cond_depth });
        }
        if self.depth_scopes != 0 {
            return Err(BuildError::UnbalancedDepthScope { open: self.depth_scopes });
        }
        self.flush_trailing();
        let root = self.open.pop().ok_or(BuildError::NoOpenChunk)?;
        let root_id = self.finish_node(root.name, root.start, root.children, None);
        self.tree.set_root(root_id);
        debug!(
            instructions = self.code.len(),
            slots = self.slot_high_water,
            chunks = self.tree.len(),
            "program built"
        );
        Ok(Program::from_parts(
            self.code,
            self.slot_high_water as usize,
            self.ordered_sources,
            self.ordered_destinations,
            self.comments,
            self.tree,
            config.max_chunk_len,
        ))
    }
}

fn leaf(name: String, range: Range<usize>, identical: Option<usize>, code: &[Instruction]) -> Chunk {
    Chunk {
        name,
        stream: StreamCounts::of(&code[range.clone()]),
        range,
        kind: ChunkKind::Leaf,
        identical_range_start: identical,
        origin: ChunkId(0),
    }
}

//! Builder patterns for many structurally identical sub-programs.

use crate::builder::{BuildError, BuildResult, Builder, Slot};
use crate::command::Opcode;
use crate::tree::ChunkId;

// ── Record/replay range ──────────────────────────────────────────────

/// A named set of entries sharing one body. The first entry is emitted
/// normally; every later entry replays it, so only its stream bindings are
/// new.
#[derive(Debug)]
pub struct RecordedRange {
    name: String,
    recorded: Option<ChunkId>,
    entries: Vec<ChunkId>,
    parallel: bool,
}

impl RecordedRange {
    pub fn open(b: &mut Builder, name: &str) -> BuildResult<Self> {
        b.open_chunk(name)?;
        Ok(RecordedRange { name: name.to_string(), recorded: None, entries: Vec::new(), parallel: false })
    }

    /// Like `open`, but entries become the children of a parallel chunk.
    pub fn open_parallel(b: &mut Builder, name: &str) -> BuildResult<Self> {
        b.open_parallel_chunk(name)?;
        Ok(RecordedRange { name: name.to_string(), recorded: None, entries: Vec::new(), parallel: true })
    }

    pub fn entry<T>(&mut self, b: &mut Builder, body: impl FnOnce(&mut Builder) -> BuildResult<T>) -> BuildResult<T> {
        let name = format!("{}[{}]", self.name, self.entries.len());
        match self.recorded {
            None => b.open_chunk(&name)?,
            Some(recorded) => b.open_identical_chunk(&name, recorded)?,
        }
        let value = body(b)?;
        let id = b.close_chunk()?;
        self.recorded.get_or_insert(id);
        self.entries.push(id);
        Ok(value)
    }

    pub fn recorded(&self) -> Option<ChunkId> {
        self.recorded
    }

    pub fn entries(&self) -> &[ChunkId] {
        &self.entries
    }

    /// Closes the set. `join` is only meaningful for a parallel set.
    pub fn close(self, b: &mut Builder, join: &[Slot]) -> BuildResult<ChunkId> {
        if self.parallel { b.close_parallel_chunk(join) } else { b.close_chunk() }
    }
}

// ── Repeated window ──────────────────────────────────────────────────

/// A scratch-only body run back to back. Later runs reuse the first run's
/// range without re-emitting it.
#[derive(Debug)]
pub struct RepeatedWindow {
    name: String,
    body: Option<ChunkId>,
    runs: usize,
}

impl RepeatedWindow {
    pub fn new(name: &str) -> Self {
        RepeatedWindow { name: name.to_string(), body: None, runs: 0 }
    }

    /// Emits the body on the first call and replays it afterwards; `body` is
    /// only invoked once.
    pub fn run(&mut self, b: &mut Builder, body: impl FnOnce(&mut Builder) -> BuildResult<()>) -> BuildResult<ChunkId> {
        let name = format!("{}#{}", self.name, self.runs);
        let id = match self.body {
            Some(recorded) => b.replay_chunk(&name, recorded)?,
            None => {
                b.open_chunk(&name)?;
                body(b)?;
                let id = b.close_chunk()?;
                self.check_pure(b, id)?;
                self.body = Some(id);
                id
            }
        };
        self.runs += 1;
        Ok(id)
    }

    /// Replays the recorded body `times` more times.
    pub fn repeat(&mut self, b: &mut Builder, times: usize) -> BuildResult<Vec<ChunkId>> {
        let Some(recorded) = self.body else {
            return Err(BuildError::NotReplayable { name: self.name.clone(), reason: "window has no recorded body" });
        };
        let mut ids = Vec::with_capacity(times);
        for _ in 0..times {
            ids.push(b.replay_chunk(&format!("{}#{}", self.name, self.runs), recorded)?);
            self.runs += 1;
        }
        Ok(ids)
    }

    pub fn runs(&self) -> usize {
        self.runs
    }

    fn check_pure(&self, b: &Builder, id: ChunkId) -> BuildResult<()> {
        let range = b.chunk(id).map(|c| c.range.clone()).unwrap_or_default();
        let streams = b.instructions()[range]
            .iter()
            .any(|i| i.op.is_stream() || i.op == Opcode::AccumulateOutput);
        if streams {
            return Err(BuildError::NotReplayable { name: self.name.clone(), reason: "window body uses external streams" });
        }
        Ok(())
    }
}

// ── Parameter frame ──────────────────────────────────────────────────

/// A fixed block of slots used as the argument block of a repeated body.
#[derive(Debug, Clone)]
pub struct ParameterFrame {
    slots: Vec<Slot>,
}

impl ParameterFrame {
    pub fn allocate(b: &mut Builder, len: usize) -> Self {
        ParameterFrame { slots: b.new_slots(len) }
    }

    pub fn fill_from_slots(&self, b: &mut Builder, values: &[Slot]) -> BuildResult<()> {
        if values.len() != self.slots.len() {
            return Err(BuildError::LengthMismatch { left: self.slots.len(), right: values.len() });
        }
        for (&param, &value) in self.slots.iter().zip(values) {
            b.copy(param, value)?;
        }
        Ok(())
    }

    /// Drains one external input per parameter; `sources` are the caller's
    /// data indices.
    pub fn fill_from_inputs(&self, b: &mut Builder, sources: &[usize]) -> BuildResult<()> {
        if sources.len() != self.slots.len() {
            return Err(BuildError::LengthMismatch { left: self.slots.len(), right: sources.len() });
        }
        for (&param, &source) in self.slots.iter().zip(sources) {
            b.copy_from_input_into(param, source)?;
        }
        Ok(())
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn get(&self, i: usize) -> Option<Slot> {
        self.slots.get(i).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

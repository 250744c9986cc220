//! Engine: prepares a routine per leaf range and walks the hoisted tree.
//!
//! Sequence children run left to right. A conditional node's body runs only
//! when the flag is set on arrival. Parallel children each start from a copy
//! of the parent's scratch and flag and own a disjoint window of the output
//! stream; at the join every join slot receives the sum of the children's
//! changes to it, in child order.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, instrument, trace};

use crate::backend::{backend_for, Backend, BackendPolicy, ExecError, ExecResult, ExecState, Routine};
use crate::config::{BackendKind, EngineConfig};
use crate::program::Program;
use crate::tree::{ChunkId, ChunkKind};

// ── Trace ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub chunk: ChunkId,
    /// The logical chunk the visited node was hoisted from.
    pub origin: ChunkId,
    pub range: Range<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Trace {
    pub events: Vec<TraceEvent>,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Visited logical chunks, with consecutive visits to pieces of the same
    /// logical chunk collapsed. Equal for every hoisting threshold of the
    /// same program.
    pub fn logical_path(&self) -> Vec<ChunkId> {
        let mut path: Vec<ChunkId> = Vec::new();
        for event in &self.events {
            if path.last() != Some(&event.origin) {
                path.push(event.origin);
            }
        }
        path
    }
}

// ── Outcome ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub scratch: Vec<f64>,
    pub input_cursor: usize,
    pub output_cursor: usize,
    pub flag: bool,
    pub trace: Trace,
}

// ── Engine ───────────────────────────────────────────────────────────

type RangeKey = (usize, usize);

#[derive(Debug)]
pub struct Engine {
    program: Program,
    config: EngineConfig,
    routines: HashMap<RangeKey, Arc<dyn Routine>>,
}

impl Engine {
    #[instrument(skip_all, fields(instructions = program.len(), backend = %config.compiled_backend))]
    pub fn new(program: Program, config: &EngineConfig) -> ExecResult<Self> {
        config.validate()?;
        let mut engine = Engine { program, config: config.clone(), routines: HashMap::new() };
        engine.prepare_missing()?;
        Ok(engine)
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Which backend runs `range`, if it has been prepared.
    pub fn backend_of(&self, range: Range<usize>) -> Option<BackendKind> {
        self.routines.get(&(range.start, range.end)).map(|r| r.kind())
    }

    /// Swaps in a re-thresholded clone of the same program. Ranges already
    /// prepared are reused; new ones are prepared now.
    pub fn rebind(&mut self, program: Program) -> ExecResult<()> {
        if program.fingerprint() != self.program.fingerprint() {
            return Err(ExecError::StaleTree { expected: self.program.fingerprint(), found: program.fingerprint() });
        }
        self.program = program;
        self.prepare_missing()
    }

    /// Distinct non-empty leaf ranges in first-visit order, with how many
    /// leaves share each.
    fn leaf_ranges(&self) -> Vec<(Range<usize>, usize)> {
        let tree = self.program.tree();
        let mut order: Vec<(Range<usize>, usize)> = Vec::new();
        let mut index: HashMap<RangeKey, usize> = HashMap::new();
        for id in tree.leaves() {
            let range = tree.get(id).range.clone();
            if range.is_empty() {
                continue;
            }
            match index.get(&(range.start, range.end)) {
                Some(&i) => order[i].1 += 1,
                None => {
                    index.insert((range.start, range.end), order.len());
                    order.push((range, 1));
                }
            }
        }
        order
    }

    fn prepare_missing(&mut self) -> ExecResult<()> {
        let policy = BackendPolicy::from_config(&self.config);
        let mut backends: Vec<Box<dyn Backend>> = Vec::new();
        let mut counts: HashMap<BackendKind, usize> = HashMap::new();
        for (range, references) in self.leaf_ranges() {
            if self.routines.contains_key(&(range.start, range.end)) {
                continue;
            }
            let kind = policy.select(range.len(), references);
            let backend = match backends.iter().position(|b| b.kind() == kind) {
                Some(i) => &mut backends[i],
                None => {
                    backends.push(backend_for(kind, &self.config)?);
                    let last = backends.len() - 1;
                    &mut backends[last]
                }
            };
            trace!(start = range.start, end = range.end, references, %kind, "leaf assigned");
            backend.prepare(&self.program, range)?;
            *counts.entry(kind).or_default() += 1;
        }
        for backend in backends {
            for routine in backend.finish()? {
                let range = routine.range();
                self.routines.insert((range.start, range.end), routine);
            }
        }
        info!(
            routines = self.routines.len(),
            prepared = ?counts,
            parallel_chunks = self.program.parallel_count(),
            "engine prepared"
        );
        Ok(())
    }

    /// Runs the program once. `inputs` must hold at least
    /// `program.input_count()` values and `outputs` room for
    /// `program.output_count()`.
    #[instrument(skip_all)]
    pub fn run(&self, inputs: &[f64], outputs: &mut [f64]) -> ExecResult<RunOutcome> {
        if inputs.len() < self.program.input_count() {
            return Err(ExecError::InputExhausted { cursor: 0, needed: self.program.input_count(), len: inputs.len() });
        }
        if outputs.len() < self.program.output_count() {
            return Err(ExecError::OutputOverflow { cursor: 0, needed: self.program.output_count(), len: outputs.len() });
        }
        let mut scratch = vec![0.0; self.program.slot_count()];
        let mut state = ExecState::new(&mut scratch, inputs, outputs);
        let mut trace = Trace::default();
        self.run_node(self.program.tree().root(), &mut state, &mut trace)?;
        let (input_cursor, output_cursor, flag) = (state.input_cursor, state.output_cursor, state.flag);
        debug!(input_cursor, output_cursor, events = trace.len(), "run finished");
        Ok(RunOutcome { scratch, input_cursor, output_cursor, flag, trace })
    }

    fn record(&self, trace: &mut Trace, id: ChunkId) {
        if self.config.trace {
            let chunk = self.program.tree().get(id);
            trace.events.push(TraceEvent { chunk: id, origin: chunk.origin, range: chunk.range.clone() });
        }
    }

    fn run_node(&self, id: ChunkId, state: &mut ExecState<'_>, trace: &mut Trace) -> ExecResult<()> {
        let chunk = self.program.tree().get(id);
        match &chunk.kind {
            ChunkKind::Leaf => {
                self.record(trace, id);
                if chunk.range.is_empty() {
                    return Ok(());
                }
                let routine = self.routines.get(&(chunk.range.start, chunk.range.end)).ok_or(
                    ExecError::MissingArtifact {
                        program: self.program.fingerprint(),
                        start: chunk.range.start,
                        end: chunk.range.end,
                    },
                )?;
                routine.execute(state)
            }
            ChunkKind::Sequence { children } => {
                for &child in children {
                    self.run_node(child, state, trace)?;
                }
                Ok(())
            }
            ChunkKind::Conditional { children, .. } => {
                self.record(trace, id);
                if state.flag {
                    for &child in children {
                        self.run_node(child, state, trace)?;
                    }
                }
                Ok(())
            }
            ChunkKind::Parallel { children, join } => self.run_parallel(children, join, state, trace),
        }
    }

    fn run_parallel(
        &self,
        children: &[ChunkId],
        join: &[u32],
        state: &mut ExecState<'_>,
        trace: &mut Trace,
    ) -> ExecResult<()> {
        let tree = self.program.tree();
        let total_in: usize = children.iter().map(|&c| tree.get(c).stream.inputs).sum();
        let total_out: usize = children.iter().map(|&c| tree.get(c).stream.outputs).sum();
        let fork: Vec<f64> = state.scratch.to_vec();
        let flag = state.flag;
        let inputs = state.inputs;
        let out_start = state.output_cursor;
        let out_len = state.outputs.len();
        let window = state.outputs.get_mut(out_start..out_start + total_out).ok_or(ExecError::OutputOverflow {
            cursor: out_start,
            needed: total_out,
            len: out_len,
        })?;

        let mut jobs: Vec<(ChunkId, usize, &mut [f64])> = Vec::with_capacity(children.len());
        let mut rest = window;
        let mut in_cursor = state.input_cursor;
        for &child in children {
            let stream = tree.get(child).stream;
            let (own, tail) = std::mem::take(&mut rest).split_at_mut(stream.outputs);
            jobs.push((child, in_cursor, own));
            rest = tail;
            in_cursor += stream.inputs;
        }

        let run_child = |(child, in_cursor, outputs): (ChunkId, usize, &mut [f64])| -> ExecResult<(Vec<f64>, Trace)> {
            let mut scratch = fork.clone();
            let mut child_state = ExecState { scratch: &mut scratch, inputs, outputs, input_cursor: in_cursor, output_cursor: 0, flag };
            let mut child_trace = Trace::default();
            self.run_node(child, &mut child_state, &mut child_trace)?;
            Ok((scratch, child_trace))
        };
        let results: Vec<ExecResult<(Vec<f64>, Trace)>> = if self.config.parallel {
            jobs.into_par_iter().map(run_child).collect()
        } else {
            jobs.into_iter().map(run_child).collect()
        };

        let mut finished = Vec::with_capacity(results.len());
        for result in results {
            finished.push(result?);
        }
        for &slot in join {
            let s = slot as usize;
            let Some(&base) = fork.get(s) else {
                return Err(ExecError::ScratchTooSmall { len: fork.len(), slot: s });
            };
            let delta: f64 = finished.iter().map(|(scratch, _)| scratch[s] - base).sum();
            state.scratch[s] += delta;
        }
        for (_, child_trace) in finished {
            trace.events.extend(child_trace.events);
        }
        state.input_cursor += total_in;
        state.output_cursor += total_out;
        trace!(children = children.len(), joined = join.len(), "parallel join");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::testing::{assert_same_slots, random_inputs, random_program};

    fn traced() -> EngineConfig {
        EngineConfig { trace: true, ..EngineConfig::interpreted() }
    }

    #[test]
    fn hoisted_tree_matches_unsplit_run() {
        let mut rng = fastrand::Rng::with_seed(31);
        for _ in 0..30 {
            let program = random_program(&mut rng, 80, &EngineConfig { max_chunk_len: 10_000, ..traced() });
            let inputs = random_inputs(&mut rng, program.input_count());
            let whole = Engine::new(program.clone(), &traced()).unwrap();
            let mut out_a = vec![0.0; program.output_count()];
            let a = whole.run(&inputs, &mut out_a).unwrap();

            let threshold = rng.usize(1..12);
            let split = Engine::new(program.with_max_chunk_len(threshold), &traced()).unwrap();
            let mut out_b = vec![0.0; program.output_count()];
            let b = split.run(&inputs, &mut out_b).unwrap();

            assert_same_slots(&a.scratch, &b.scratch);
            assert_same_slots(&out_a, &out_b);
            assert_eq!((a.input_cursor, a.output_cursor, a.flag), (b.input_cursor, b.output_cursor, b.flag));
            assert_eq!(a.trace.logical_path(), b.trace.logical_path(), "threshold {threshold}");
        }
    }

    #[test]
    fn parallel_join_sums_designated_slots() {
        let mut b = Builder::new();
        let total = b.new_zero().unwrap();
        let untouched = b.new_zero().unwrap();
        b.open_parallel_chunk("branches").unwrap();
        let mut partials = Vec::new();
        for i in 0..4 {
            b.open_chunk(&format!("branch{i}")).unwrap();
            let x = b.copy_from_input(i).unwrap();
            b.multiply(x, x).unwrap();
            b.increment(total, x).unwrap();
            b.increment(untouched, x).unwrap();
            b.copy_to_output(x, i).unwrap();
            partials.push(x);
            b.close_chunk().unwrap();
        }
        b.close_parallel_chunk(&[total]).unwrap();
        let program = b.finish(&EngineConfig::interpreted()).unwrap();

        for parallel in [false, true] {
            let config = EngineConfig { parallel, ..EngineConfig::interpreted() };
            let engine = Engine::new(program.clone(), &config).unwrap();
            let mut outputs = vec![0.0; 4];
            let outcome = engine.run(&[1.0, 2.0, 3.0, 4.0], &mut outputs).unwrap();
            assert_eq!(outcome.scratch[total.index()], 1.0 + 4.0 + 9.0 + 16.0);
            assert_eq!(outcome.scratch[untouched.index()], 0.0);
            assert_eq!(outputs, vec![1.0, 4.0, 9.0, 16.0]);
            assert_eq!((outcome.input_cursor, outcome.output_cursor), (4, 4));
        }
    }

    #[test]
    fn nested_parallel_depth_scope_reaches_root() {
        let mut b = Builder::new();
        let total = b.new_zero().unwrap();
        b.open_parallel_chunk("outer").unwrap();
        for half in 0..2 {
            b.open_chunk(&format!("half{half}")).unwrap();
            b.open_parallel_chunk(&format!("inner{half}")).unwrap();
            for k in 0..2 {
                b.open_chunk(&format!("leaf{half}.{k}")).unwrap();
                b.enter_depth_scope();
                let x = b.copy_from_input(2 * half + k).unwrap();
                b.increment(total, x).unwrap();
                b.exit_depth_scope().unwrap();
                b.close_chunk().unwrap();
            }
            b.close_parallel_chunk(&[]).unwrap();
            b.close_chunk().unwrap();
        }
        b.close_parallel_chunk(&[]).unwrap();
        let program = b.finish(&EngineConfig::interpreted()).unwrap();

        let joins: Vec<&[u32]> = program
            .logical_tree()
            .iter()
            .filter_map(|(_, c)| match &c.kind {
                ChunkKind::Parallel { join, .. } => Some(join.as_slice()),
                _ => None,
            })
            .collect();
        assert_eq!(joins.len(), 3);
        assert!(joins.iter().all(|j| j.contains(&(total.index() as u32))));

        for parallel in [false, true] {
            let config = EngineConfig { parallel, ..EngineConfig::interpreted() };
            let engine = Engine::new(program.clone(), &config).unwrap();
            let outcome = engine.run(&[1.0, 2.0, 4.0, 8.0], &mut []).unwrap();
            assert_eq!(outcome.scratch[total.index()], 15.0);
            assert_eq!(outcome.input_cursor, 4);
        }
    }

    #[cfg(feature = "cranelift")]
    #[test]
    fn native_engines_rebuilt_many_times() {
        let mut b = Builder::new();
        let acc = b.copy_from_input(0).unwrap();
        let step = b.copy_from_input(1).unwrap();
        for i in 0..300 {
            b.open_chunk(&format!("step{i}")).unwrap();
            b.increment(acc, step).unwrap();
            b.close_chunk().unwrap();
        }
        b.copy_to_output(acc, 0).unwrap();
        let program = b.finish(&EngineConfig { max_chunk_len: 1, ..EngineConfig::interpreted() }).unwrap();
        assert!(program.tree().leaves().len() >= 300);

        let inputs = [2.0, 0.5];
        let reference = Engine::new(program.clone(), &EngineConfig::interpreted()).unwrap();
        let mut expected = vec![0.0; 1];
        let want = reference.run(&inputs, &mut expected).unwrap();
        assert_eq!(expected, vec![152.0]);

        let config = EngineConfig::compiled(BackendKind::Native);
        for _ in 0..200 {
            let engine = Engine::new(program.clone(), &config).unwrap();
            let leaf = program.tree().get(program.tree().leaves()[1]).range.clone();
            assert_eq!(engine.backend_of(leaf), Some(BackendKind::Native));
            let mut outputs = vec![0.0; 1];
            let got = engine.run(&inputs, &mut outputs).unwrap();
            assert_same_slots(&want.scratch, &got.scratch);
            assert_eq!(outputs, expected);
        }
    }

    #[test]
    fn rebind_rejects_foreign_program() {
        let mut b = Builder::new();
        b.new_zero().unwrap();
        let one = b.finish(&EngineConfig::interpreted()).unwrap();
        let mut b = Builder::new();
        let s = b.new_zero().unwrap();
        b.increment(s, s).unwrap();
        let other = b.finish(&EngineConfig::interpreted()).unwrap();

        let mut engine = Engine::new(one.clone(), &EngineConfig::interpreted()).unwrap();
        assert!(engine.rebind(one.with_max_chunk_len(1)).is_ok());
        assert!(matches!(engine.rebind(other), Err(ExecError::StaleTree { .. })));
    }

    #[test]
    fn short_buffers_rejected_up_front() {
        let mut b = Builder::new();
        let x = b.copy_from_input(0).unwrap();
        b.copy_to_output(x, 0).unwrap();
        let program = b.finish(&EngineConfig::interpreted()).unwrap();
        let engine = Engine::new(program, &EngineConfig::interpreted()).unwrap();
        assert!(matches!(engine.run(&[], &mut [0.0]), Err(ExecError::InputExhausted { .. })));
        assert!(matches!(engine.run(&[1.0], &mut []), Err(ExecError::OutputOverflow { .. })));
    }

    #[test]
    fn trace_disabled_by_default() {
        let mut b = Builder::new();
        b.new_zero().unwrap();
        let program = b.finish(&EngineConfig::interpreted()).unwrap();
        let outcome = Engine::new(program, &EngineConfig::interpreted()).unwrap().run(&[], &mut []).unwrap();
        assert!(outcome.trace.is_empty());
    }
}

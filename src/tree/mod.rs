//! Chunk tree: an arena of named instruction ranges.
//!
//! The builder produces a *logical* tree (one node per chunk the caller
//! opened). `hoist` derives the executable tree from it, splitting every leaf
//! longer than the threshold into balanced pieces. Oversized `If…EndIf`
//! blocks become `Conditional` nodes that own their guard and `EndIf`.

use std::ops::Range;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::command::{matching_end_if, Instruction, Opcode, StreamCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChunkId(pub(crate) u32);

impl ChunkId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ChunkKind {
    Leaf,
    Sequence { children: Vec<ChunkId> },
    /// Children run independently; `join` slots are summed back at the end.
    Parallel { children: Vec<ChunkId>, join: Vec<u32> },
    /// `guard` is the `If` position, `end` its `EndIf`.
    Conditional { guard: usize, end: usize, children: Vec<ChunkId> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub name: String,
    /// Leaves: the range executed. Other kinds: the span their instructions
    /// were emitted into (empty for replayed leaves).
    pub range: Range<usize>,
    pub kind: ChunkKind,
    /// Set when this leaf replays a range recorded earlier.
    pub identical_range_start: Option<usize>,
    /// The logical chunk this node was derived from.
    pub origin: ChunkId,
    pub stream: StreamCounts,
}

impl Chunk {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, ChunkKind::Leaf)
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.kind, ChunkKind::Parallel { .. })
    }

    pub fn children(&self) -> &[ChunkId] {
        match &self.kind {
            ChunkKind::Leaf => &[],
            ChunkKind::Sequence { children }
            | ChunkKind::Parallel { children, .. }
            | ChunkKind::Conditional { children, .. } => children,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkTree {
    nodes: Vec<Chunk>,
    root: ChunkId,
}

impl ChunkTree {
    pub(crate) fn new() -> Self {
        ChunkTree { nodes: Vec::new(), root: ChunkId(0) }
    }

    /// A tree with one leaf covering `code`.
    pub fn single_leaf(name: &str, code: &[Instruction]) -> Self {
        let mut tree = ChunkTree::new();
        let root = tree.push(Chunk {
            name: name.to_string(),
            range: 0..code.len(),
            kind: ChunkKind::Leaf,
            identical_range_start: None,
            origin: ChunkId(0),
            stream: StreamCounts::of(code),
        });
        tree.root = root;
        tree
    }

    pub(crate) fn push(&mut self, chunk: Chunk) -> ChunkId {
        let id = ChunkId(self.nodes.len() as u32);
        self.nodes.push(chunk);
        id
    }

    pub(crate) fn set_root(&mut self, root: ChunkId) {
        self.root = root;
    }

    pub(crate) fn get_mut(&mut self, id: ChunkId) -> &mut Chunk {
        &mut self.nodes[id.index()]
    }

    pub fn root(&self) -> ChunkId {
        self.root
    }

    pub fn get(&self, id: ChunkId) -> &Chunk {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChunkId, &Chunk)> {
        self.nodes.iter().enumerate().map(|(i, c)| (ChunkId(i as u32), c))
    }

    /// Leaves in execution order.
    pub fn leaves(&self) -> Vec<ChunkId> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let chunk = self.get(id);
            if chunk.is_leaf() {
                out.push(id);
            } else {
                stack.extend(chunk.children().iter().rev().copied());
            }
        }
        out
    }

    /// Checks that every leaf range lies inside `code` and is balanced, and
    /// that every conditional node's guard and end are an `If`/`EndIf` pair.
    #[cfg(test)]
    pub(crate) fn matches(&self, code: &[Instruction]) -> Result<(), Range<usize>> {
        for (_, chunk) in self.iter() {
            match &chunk.kind {
                ChunkKind::Leaf => {
                    let range = chunk.range.clone();
                    let Some(slice) = code.get(range.clone()) else {
                        return Err(range);
                    };
                    if !crate::command::is_balanced(slice) {
                        return Err(range);
                    }
                }
                ChunkKind::Conditional { guard, end, .. } => {
                    let paired = code.get(*guard).map(|i| i.op) == Some(Opcode::If)
                        && matching_end_if(code, *guard, code.len()) == Some(*end);
                    if !paired {
                        return Err(*guard..*end + 1);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ── Hoisting ─────────────────────────────────────────────────────────

/// Splits every leaf of `logical` longer than `max_chunk_len`.
#[instrument(skip_all, fields(max_chunk_len))]
pub fn hoist(logical: &ChunkTree, code: &[Instruction], max_chunk_len: usize) -> ChunkTree {
    let max = max_chunk_len.max(1);
    let mut out = ChunkTree { nodes: Vec::with_capacity(logical.len()), root: ChunkId(0) };
    let root = hoist_node(logical, logical.root, code, max, &mut out);
    out.root = root;
    debug!(logical = logical.len(), hoisted = out.len(), "hoisted chunk tree");
    out
}

fn hoist_node(
    logical: &ChunkTree,
    id: ChunkId,
    code: &[Instruction],
    max: usize,
    out: &mut ChunkTree,
) -> ChunkId {
    let chunk = logical.get(id);
    let kind = match &chunk.kind {
        ChunkKind::Leaf if chunk.range.len() > max => {
            let mut splitter = Splitter { code, max, origin: id, replay: chunk.identical_range_start.is_some(), out };
            let children = splitter.split(chunk.range.clone(), &chunk.name);
            ChunkKind::Sequence { children }
        }
        ChunkKind::Leaf => ChunkKind::Leaf,
        ChunkKind::Sequence { children } => ChunkKind::Sequence {
            children: children.iter().map(|&c| hoist_node(logical, c, code, max, out)).collect(),
        },
        ChunkKind::Parallel { children, join } => ChunkKind::Parallel {
            children: children.iter().map(|&c| hoist_node(logical, c, code, max, out)).collect(),
            join: join.clone(),
        },
        ChunkKind::Conditional { guard, end, children } => ChunkKind::Conditional {
            guard: *guard,
            end: *end,
            children: children.iter().map(|&c| hoist_node(logical, c, code, max, out)).collect(),
        },
    };
    out.push(Chunk {
        name: chunk.name.clone(),
        range: chunk.range.clone(),
        kind,
        identical_range_start: chunk.identical_range_start,
        origin: id,
        stream: chunk.stream,
    })
}

struct Splitter<'a> {
    code: &'a [Instruction],
    max: usize,
    origin: ChunkId,
    replay: bool,
    out: &'a mut ChunkTree,
}

impl Splitter<'_> {
    /// Greedily packs top-level items (single instructions or whole
    /// `If…EndIf` blocks) into leaves of at most `max` instructions.
    fn split(&mut self, range: Range<usize>, name: &str) -> Vec<ChunkId> {
        let mut children = Vec::new();
        let mut leaf_start = range.start;
        let mut pos = range.start;
        while pos < range.end {
            let is_if = self.code[pos].op == Opcode::If;
            let item_end = if is_if {
                matching_end_if(self.code, pos, range.end).map_or(range.end, |e| e + 1)
            } else {
                pos + 1
            };
            let item_len = item_end - pos;
            if is_if && item_len > self.max {
                self.flush(leaf_start..pos, name, &mut children);
                let end = item_end - 1;
                let body = self.split(pos + 1..end, name);
                let stream = body.iter().fold(StreamCounts::default(), |acc, &c| acc.add(self.out.get(c).stream));
                let id = self.out.push(Chunk {
                    name: format!("{name}.if{pos}"),
                    range: pos..item_end,
                    kind: ChunkKind::Conditional { guard: pos, end, children: body },
                    identical_range_start: None,
                    origin: self.origin,
                    stream,
                });
                children.push(id);
                leaf_start = item_end;
            } else if pos > leaf_start && pos - leaf_start + item_len > self.max {
                self.flush(leaf_start..pos, name, &mut children);
                leaf_start = pos;
            }
            pos = item_end;
        }
        self.flush(leaf_start..range.end, name, &mut children);
        children
    }

    fn flush(&mut self, range: Range<usize>, name: &str, children: &mut Vec<ChunkId>) {
        if range.is_empty() {
            return;
        }
        let id = self.out.push(Chunk {
            name: format!("{name}.{}", range.start),
            identical_range_start: self.replay.then_some(range.start),
            stream: StreamCounts::of(&self.code[range.clone()]),
            range,
            kind: ChunkKind::Leaf,
            origin: self.origin,
        });
        children.push(id);
    }
}

use alloc::vec::Vec;

use smallvec::SmallVec;
use weft_core::Instruction;

use crate::error::FlowError;

// NODE ID
// ================================================================================================

/// Index of a region in the [`RegionTree`] arena.
///
/// Regions reference each other by id rather than by ownership, so back-edges
/// never create cyclic ownership; ids stay valid for the lifetime of the
/// tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeId(u32);

impl NodeId {
    fn as_usize(self) -> usize {
        self.0 as usize
    }
}

// REGION NODES
// ================================================================================================

/// Structural kind of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionKind {
    Root,
    Block,
    Loop,
    If,
    Else,
    Try,
    Catch,
    /// A zero-span leaf: a relative-depth branch, a branch table, or an
    /// injected instruction sequence.
    Leaf,
}

/// Marker emitted when the emitter enters the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartOp {
    Block,
    Loop,
    If,
    Try,
    Catch,
}

/// Marker emitted when the emitter leaves the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndOp {
    End,
    /// An `if` immediately followed by its else arm closes with an `else`
    /// marker instead of an `end`.
    Else,
}

/// Branch flavor of a leaf node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchOp {
    Br,
    BrIf,
}

/// Payload of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeData {
    None,
    /// A relative-depth branch. `pos` is the source jump position the emitted
    /// instruction reports; `target` is the absolute position the depth
    /// resolves to, kept so later middle-block insertions can re-level the
    /// depth.
    Branch { op: BranchOp, depth: u32, target: u32, pos: u32 },
    /// A branch table: per-case depths in key order plus the default, each
    /// with its absolute target.
    Table {
        depths: Vec<u32>,
        targets: Vec<u32>,
        default_depth: u32,
        default_target: u32,
        pos: u32,
    },
    /// Instructions injected verbatim when the emitter reaches the node.
    Inject(Vec<Instruction>),
}

/// A region in the output tree: a bytecode range, the markers delimiting it,
/// and ordered non-overlapping children.
#[derive(Debug)]
pub(crate) struct BranchNode {
    pub kind: RegionKind,
    pub start_pos: u32,
    pub end_pos: u32,
    pub start_op: Option<StartOp>,
    pub end_op: Option<EndOp>,
    pub data: NodeData,
    /// For loops: the position a continue re-enters at.
    pub continue_pos: u32,
    pub line: u32,
    parent: Option<NodeId>,
    children: SmallVec<[NodeId; 4]>,
}

impl BranchNode {
    pub fn region(kind: RegionKind, start: u32, end: u32, line: u32) -> Self {
        let (start_op, end_op) = match kind {
            RegionKind::Block => (Some(StartOp::Block), Some(EndOp::End)),
            RegionKind::Loop => (Some(StartOp::Loop), Some(EndOp::End)),
            RegionKind::If => (Some(StartOp::If), Some(EndOp::End)),
            RegionKind::Else => (None, Some(EndOp::End)),
            RegionKind::Try => (Some(StartOp::Try), None),
            RegionKind::Catch => (Some(StartOp::Catch), Some(EndOp::End)),
            RegionKind::Root | RegionKind::Leaf => (None, None),
        };
        Self {
            kind,
            start_pos: start,
            end_pos: end,
            start_op,
            end_op,
            data: NodeData::None,
            continue_pos: start,
            line,
            parent: None,
            children: SmallVec::new(),
        }
    }

    pub fn leaf(pos: u32, data: NodeData, line: u32) -> Self {
        Self {
            kind: RegionKind::Leaf,
            start_pos: pos,
            end_pos: pos,
            start_op: None,
            end_op: None,
            data,
            continue_pos: pos,
            line,
            parent: None,
            children: SmallVec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == RegionKind::Leaf
    }

    pub fn contains(&self, pos: u32) -> bool {
        self.start_pos <= pos && pos < self.end_pos
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

// REGION TREE
// ================================================================================================

/// Arena of [`BranchNode`]s rooted at a synthetic node spanning the whole
/// method.
#[derive(Debug)]
pub(crate) struct RegionTree {
    nodes: Vec<BranchNode>,
}

/// Constructors
impl RegionTree {
    pub fn new(code_size: u32) -> Self {
        let root = BranchNode::region(RegionKind::Root, 0, code_size, 0);
        Self { nodes: vec![root] }
    }
}

/// Accessors
impl RegionTree {
    pub fn root_id(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &BranchNode {
        &self.nodes[id.as_usize()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BranchNode {
        &mut self.nodes[id.as_usize()]
    }

    /// Descends from `from` to the deepest region containing `pos`.
    pub fn deepest_containing(&self, from: NodeId, pos: u32) -> NodeId {
        let mut id = from;
        loop {
            let next = self
                .node(id)
                .children
                .iter()
                .copied()
                .find(|&c| !self.node(c).is_leaf() && self.node(c).contains(pos));
            match next {
                Some(c) => id = c,
                None => return id,
            }
        }
    }

    /// The position a branch out of this region lands at.
    ///
    /// For a `try` that is the end of its catch chain; for an `if` followed
    /// by an `else` it is the end of the else arm. For every other region it
    /// is the region's own end.
    pub fn effective_end(&self, id: NodeId) -> u32 {
        let node = self.node(id);
        let siblings = match node.parent {
            Some(p) => self.node(p).children(),
            None => return node.end_pos,
        };
        let idx = siblings.iter().position(|&c| c == id).expect("node missing from its parent");
        match node.kind {
            RegionKind::Try => {
                let mut end = node.end_pos;
                for &next in &siblings[idx + 1..] {
                    if self.node(next).kind == RegionKind::Catch {
                        end = self.node(next).end_pos;
                    } else {
                        break;
                    }
                }
                end
            },
            RegionKind::If => match siblings.get(idx + 1) {
                Some(&next) if self.node(next).kind == RegionKind::Else => {
                    self.node(next).end_pos
                },
                _ => node.end_pos,
            },
            _ => node.end_pos,
        }
    }

    /// First non-leaf child of `parent` starting exactly at `pos`.
    pub fn child_starting_at(&self, parent: NodeId, pos: u32) -> Option<NodeId> {
        self.node(parent)
            .children
            .iter()
            .copied()
            .find(|&c| !self.node(c).is_leaf() && self.node(c).start_pos == pos)
    }

    /// The sibling immediately before `id`.
    pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.node(id).parent?;
        let siblings = self.node(parent).children();
        let idx = siblings.iter().position(|&c| c == id)?;
        idx.checked_sub(1).map(|i| siblings[i])
    }
}

/// Mutators
impl RegionTree {
    /// Adds `node` under `parent`, keeping children ordered by start and
    /// pairwise non-overlapping.
    ///
    /// Existing siblings that the new region fully contains are re-parented
    /// into it, and any branch inside them whose target crosses the new
    /// boundary has its depth incremented. A partial overlap with a sibling
    /// is an invariant breach and fails.
    pub fn add_child(&mut self, parent: NodeId, node: BranchNode) -> Result<NodeId, FlowError> {
        let (start, end) = (node.start_pos, node.end_pos);
        {
            let p = self.node(parent);
            if start < p.start_pos || end > p.end_pos {
                return Err(FlowError::NodeOverlap { start, end });
            }
        }

        let mut adopted: SmallVec<[NodeId; 4]> = SmallVec::new();
        if start < end {
            for &c in self.node(parent).children() {
                let child = self.node(c);
                if child.start_pos >= start && child.end_pos <= end && child.start_pos < end {
                    adopted.push(c);
                } else if child.start_pos < end
                    && start < child.end_pos
                    && !(child.start_pos <= start && end <= child.end_pos)
                {
                    return Err(FlowError::NodeOverlap { start, end });
                } else if child.start_pos <= start && end <= child.end_pos && !child.is_leaf() {
                    // the new region belongs inside this child, not beside it
                    return Err(FlowError::NodeOverlap { start, end });
                }
            }
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.node_mut(id).parent = Some(parent);

        self.node_mut(parent).children.retain(|c| !adopted.contains(c));
        for &c in &adopted {
            self.node_mut(c).parent = Some(id);
            self.bump_crossing_depths(c, start, end);
        }
        self.node_mut(id).children = adopted;

        let insert_at = {
            let children = self.node(parent).children();
            children
                .iter()
                .position(|&c| self.node(c).start_pos > start)
                .unwrap_or(children.len())
        };
        self.node_mut(parent).children.insert(insert_at, id);
        Ok(id)
    }

    /// Synthesizes a middle block spanning `[parent.start, end)`, moving the
    /// children in range into it.
    pub fn insert_middle(&mut self, parent: NodeId, end: u32, line: u32) -> Result<NodeId, FlowError> {
        let start = self.node(parent).start_pos;
        log::trace!("inserting middle block [{start}, {end})");
        self.add_child(parent, BranchNode::region(RegionKind::Block, start, end, line))
    }

    /// Increments the depth of every branch in the subtree under `id` whose
    /// target lies outside `[start, end]`: those branches now cross one more
    /// region boundary.
    fn bump_crossing_depths(&mut self, id: NodeId, start: u32, end: u32) {
        let crosses = |target: u32| target < start || target > end;
        match &mut self.node_mut(id).data {
            NodeData::Branch { depth, target, .. } => {
                if crosses(*target) {
                    *depth += 1;
                }
            },
            NodeData::Table { depths, targets, default_depth, default_target, .. } => {
                for (depth, target) in depths.iter_mut().zip(targets.iter()) {
                    if crosses(*target) {
                        *depth += 1;
                    }
                }
                if crosses(*default_target) {
                    *default_depth += 1;
                }
            },
            NodeData::None | NodeData::Inject(_) => {},
        }
        let children: SmallVec<[NodeId; 4]> = self.node(id).children.clone();
        for c in children {
            self.bump_crossing_depths(c, start, end);
        }
    }
}

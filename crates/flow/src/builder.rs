use alloc::{collections::VecDeque, vec::Vec};

use itertools::Itertools;
use weft_core::{
    BlockOp, CompareOp, InstrOp, Instruction, InstructionList, LocalKind, ValueType,
};

use crate::{
    breaks::BreakBlock,
    error::FlowError,
    normalize::{negate_compare_at, remove_placeholder_at},
    options::{LocalAllocator, TranslationOptions},
    parsed::{IfData, LoopData, LoopShape, ParsedBlock, ParsedOp, Span, SwitchData, TryData},
    tree::{BranchNode, BranchOp, NodeData, NodeId, RegionKind, RegionTree},
};

// REGION TREE BUILDER
// ================================================================================================

/// Recursive descent over the normalized, sorted parsed stream.
///
/// Each region consumes every record starting inside its span; jumps that
/// cannot be expressed against the tree built so far are queued as break
/// records for the second pass.
pub(crate) struct Builder<'a> {
    pub tree: &'a mut RegionTree,
    pub breaks: &'a mut Vec<BreakBlock>,
    pub instrs: &'a mut InstructionList,
    pub options: &'a mut TranslationOptions,
    pub locals: &'a mut LocalAllocator,
    pub ops: VecDeque<ParsedBlock>,
}

impl Builder<'_> {
    pub fn run(mut self) -> Result<(), FlowError> {
        let root = self.tree.root_id();
        self.calculate_region(root)?;
        debug_assert!(self.ops.is_empty(), "parsed records left past the method end");
        Ok(())
    }

    /// Consumes every parsed record starting inside `parent`.
    fn calculate_region(&mut self, parent: NodeId) -> Result<(), FlowError> {
        while let Some(front) = self.ops.front() {
            if front.span.start >= self.tree.node(parent).end_pos {
                break;
            }
            let block = self.ops.pop_front().expect("front exists");
            match block.op {
                ParsedOp::Loop(data) => self.calculate_loop(parent, block.span, data)?,
                ParsedOp::If(data) => self.calculate_if(parent, block.span, data)?,
                ParsedOp::Switch(data) => self.calculate_switch(parent, block.span, data)?,
                ParsedOp::Try(data) => self.calculate_try(parent, block.span, data)?,
                ParsedOp::Goto => self.handle_goto(parent, block.span)?,
                // returns only served as terminators during loop detection
                ParsedOp::Return => {},
            }
        }
        Ok(())
    }

    // LOOPS
    // --------------------------------------------------------------------------------------------

    /// A loop region is always a `loop` wrapped in a `block` sharing its
    /// span: forward breaks target the block, back-edges the loop.
    fn calculate_loop(
        &mut self,
        parent: NodeId,
        span: Span,
        data: LoopData,
    ) -> Result<(), FlowError> {
        log::trace!("loop [{}, {}) continues at {}", span.start, span.end, data.continue_pos);
        let block = self.tree.add_child(
            parent,
            BranchNode::region(RegionKind::Block, span.start, span.end, span.line),
        )?;
        let mut loop_node = BranchNode::region(RegionKind::Loop, span.start, span.end, span.line);
        loop_node.continue_pos = data.continue_pos;
        let loop_id = self.tree.add_child(block, loop_node)?;

        if let LoopShape::While { exit_pos, back_edge } = data.shape {
            // conditional exit right after the hoisted condition
            self.breaks.push(BreakBlock {
                op: BranchOp::BrIf,
                branch: loop_id,
                break_pos: exit_pos,
                end_position: span.end,
                line: span.line,
            });
            // unconditional back-edge at the tail
            self.tree.add_child(
                loop_id,
                BranchNode::leaf(
                    back_edge + 1,
                    NodeData::Branch {
                        op: BranchOp::Br,
                        depth: 0,
                        target: data.continue_pos,
                        pos: back_edge,
                    },
                    span.line,
                ),
            )?;
        }
        self.calculate_region(loop_id)
    }

    // GOTOS
    // --------------------------------------------------------------------------------------------

    /// A goto is either a back-edge continue, a trivial fall-through, or an
    /// outward break left for the resolver.
    fn handle_goto(&mut self, parent: NodeId, span: Span) -> Result<(), FlowError> {
        if span.end < span.start {
            let mut node = parent;
            let mut deep = 0u32;
            loop {
                let n = self.tree.node(node);
                if n.kind == RegionKind::Loop && n.continue_pos == span.end {
                    self.tree.add_child(
                        parent,
                        BranchNode::leaf(
                            span.start + 1,
                            NodeData::Branch {
                                op: BranchOp::Br,
                                depth: deep,
                                target: span.end,
                                pos: span.start,
                            },
                            span.line,
                        ),
                    )?;
                    return Ok(());
                }
                match n.parent() {
                    Some(p) => {
                        node = p;
                        deep += 1;
                    },
                    None => {
                        return Err(FlowError::IrreducibleBackJump {
                            target: span.end,
                            line: span.line,
                        });
                    },
                }
            }
        } else if span.end == span.next {
            Ok(())
        } else {
            self.breaks.push(BreakBlock {
                op: BranchOp::Br,
                branch: parent,
                break_pos: span.start,
                end_position: span.end,
                line: span.line,
            });
            Ok(())
        }
    }

    // CONDITIONALS
    // --------------------------------------------------------------------------------------------

    /// Materializes one conditional: the do-while tail case, the outward
    /// break case, or a structural `if` with an optional else arm and any
    /// preceding short-circuit conjuncts.
    fn calculate_if(&mut self, parent: NodeId, span: Span, data: IfData) -> Result<(), FlowError> {
        // a backward conditional is the condition at the tail of a do-while
        // loop: it becomes the conditional continue itself
        if span.end < span.start {
            remove_placeholder_at(self.instrs, span.start)?;
            negate_compare_at(self.instrs, data.compare_pos, span.line)?;
            let mut node = parent;
            let mut deep = 0u32;
            loop {
                let n = self.tree.node(node);
                if n.kind == RegionKind::Loop && n.continue_pos == span.end {
                    break;
                }
                match n.parent() {
                    Some(p) => {
                        node = p;
                        deep += 1;
                    },
                    None => {
                        return Err(FlowError::IrreducibleBackJump {
                            target: span.end,
                            line: span.line,
                        });
                    },
                }
            }
            self.tree.add_child(
                parent,
                BranchNode::leaf(
                    span.start + 1,
                    NodeData::Branch {
                        op: BranchOp::BrIf,
                        depth: deep,
                        target: span.end,
                        pos: span.start,
                    },
                    span.line,
                ),
            )?;
            return Ok(());
        }

        // a then-range escaping the parent cannot become a structural if
        // here; defer it to the break resolver un-negated
        let parent_end = self.tree.node(parent).end_pos;
        let parent_kind = self.tree.node(parent).kind;
        if span.end > parent_end || (span.end == parent_end && parent_kind != RegionKind::Root) {
            remove_placeholder_at(self.instrs, span.start)?;
            self.breaks.push(BreakBlock {
                op: BranchOp::BrIf,
                branch: parent,
                break_pos: span.start,
                end_position: span.end,
                line: span.line,
            });
            return Ok(());
        }

        let else_pos = span.end;
        let chain = self.collect_chain(span, data, else_pos);

        // the last chain member becomes the structural if; everything before
        // it is a conjunct of the top-level condition
        let last = chain.last().expect("chain holds at least the primary conditional");
        let then_start = last.0.next;
        log::trace!(
            "if at {} with {} short-circuit terms, then [{then_start}, {else_pos})",
            span.start,
            chain.len() - 1,
        );

        // else arm: the then range ends with a goto over it
        let mut else_end = else_pos;
        let mut has_else = false;
        if let Some(idx) = (0..self.ops.len()).find(|&i| {
            let b = &self.ops[i];
            matches!(b.op, ParsedOp::Goto)
                && b.span.next == else_pos
                && b.span.start >= then_start
                && b.span.start < else_pos
                && b.span.end > else_pos
                && b.span.end <= parent_end
        }) {
            else_end = self.ops[idx].span.end;
            has_else = true;
            self.ops.remove(idx);
        }

        let outer = self.tree.add_child(
            parent,
            BranchNode::region(RegionKind::Block, chain[0].0.start, else_end, span.line),
        )?;
        for (s, _) in &chain[..chain.len() - 1] {
            remove_placeholder_at(self.instrs, s.start)?;
            self.breaks.push(BreakBlock {
                op: BranchOp::BrIf,
                branch: outer,
                break_pos: s.start,
                end_position: s.end,
                line: s.line,
            });
        }
        let (last_span, last_data) = chain.last().expect("non-empty").clone();
        remove_placeholder_at(self.instrs, last_span.start)?;
        negate_compare_at(self.instrs, last_data.compare_pos, last_span.line)?;

        let mut if_node =
            BranchNode::region(RegionKind::If, then_start, else_pos, last_span.line);
        if has_else {
            if_node.end_op = Some(crate::tree::EndOp::Else);
        }
        let the_if = self.tree.add_child(outer, if_node)?;
        self.calculate_region(the_if)?;

        if has_else {
            let else_node = self.tree.add_child(
                outer,
                BranchNode::region(RegionKind::Else, else_pos, else_end, last_span.line),
            )?;
            self.calculate_region(else_node)?;
        }
        Ok(())
    }

    /// Collects the maximal run of consecutive conditionals that together
    /// evaluate one top-level condition: each one targets the else position
    /// or the fall-through of a later member.
    fn collect_chain(&mut self, span: Span, data: IfData, else_pos: u32) -> Vec<(Span, IfData)> {
        let mut chain: Vec<(Span, IfData)> = vec![(span, data)];
        loop {
            let take = match self.ops.front() {
                Some(ParsedBlock { op: ParsedOp::If(_), span: s })
                    if s.end >= s.start && s.start < else_pos && s.end <= else_pos =>
                {
                    true
                },
                _ => false,
            };
            if !take {
                break;
            }
            let block = self.ops.pop_front().expect("front exists");
            match block.op {
                ParsedOp::If(d) => chain.push((block.span, d)),
                _ => unreachable!("checked above"),
            }
        }
        // shrink until every member points at the else position or re-enters
        // the remaining condition
        while chain.len() > 1 {
            let last_idx = chain.len() - 1;
            let valid = chain[last_idx].0.end == else_pos
                && chain.iter().enumerate().all(|(i, (s, _))| {
                    s.end == else_pos
                        || chain[i + 1..].iter().any(|(later, _)| s.end == later.next)
                });
            if valid {
                break;
            }
            let (s, d) = chain.pop().expect("len > 1");
            self.ops.push_front(ParsedBlock { op: ParsedOp::If(d), span: s });
        }
        chain
    }

    // SWITCHES
    // --------------------------------------------------------------------------------------------

    /// Builds the staircase of nested blocks, one per distinct case target,
    /// with the dispatch at the innermost level: a branch table for a table
    /// switch, compare-and-branch runs for a lookup switch.
    fn calculate_switch(
        &mut self,
        parent: NodeId,
        span: Span,
        data: SwitchData,
    ) -> Result<(), FlowError> {
        let case_ends: Vec<u32> = data
            .targets
            .iter()
            .copied()
            .chain([data.default])
            .sorted_unstable()
            .dedup()
            .collect();

        let mut blocks: Vec<NodeId> = Vec::with_capacity(case_ends.len());
        let mut level = parent;
        for &end in case_ends.iter().rev() {
            level = self.tree.add_child(
                level,
                BranchNode::region(RegionKind::Block, span.start, end, span.line),
            )?;
            blocks.push(level);
        }
        blocks.reverse();
        let innermost = blocks[0];
        let depth_of = |target: u32| {
            case_ends.iter().position(|&e| e == target).expect("every target is a case end") as u32
        };

        match &data.keys {
            Some(keys) => {
                // lookup switch: spill the scrutinee, then one guarded branch
                // per key and an unconditional branch to the default
                let slot = self.locals.temp(ValueType::I32);
                let spill = Instruction::new(
                    InstrOp::Local { kind: LocalKind::Set, slot, ty: ValueType::I32 },
                    span.start,
                    span.line,
                );
                self.tree.add_child(
                    innermost,
                    BranchNode::leaf(span.start, NodeData::Inject(vec![spill]), span.line),
                )?;
                for (&key, &target) in keys.iter().zip(data.targets.iter()) {
                    let run = vec![
                        Instruction::new(
                            InstrOp::Local { kind: LocalKind::Get, slot, ty: ValueType::I32 },
                            span.start,
                            span.line,
                        ),
                        Instruction::new(
                            InstrOp::Const(weft_core::ConstVal::I32(key)),
                            span.start,
                            span.line,
                        ),
                        Instruction::new(InstrOp::Compare(CompareOp::Eq), span.start, span.line),
                    ];
                    self.tree.add_child(
                        innermost,
                        BranchNode::leaf(span.start, NodeData::Inject(run), span.line),
                    )?;
                    self.tree.add_child(
                        innermost,
                        BranchNode::leaf(
                            span.start,
                            NodeData::Branch {
                                op: BranchOp::BrIf,
                                depth: depth_of(target),
                                target,
                                pos: span.start,
                            },
                            span.line,
                        ),
                    )?;
                }
                self.tree.add_child(
                    innermost,
                    BranchNode::leaf(
                        span.start,
                        NodeData::Branch {
                            op: BranchOp::Br,
                            depth: depth_of(data.default),
                            target: data.default,
                            pos: span.start,
                        },
                        span.line,
                    ),
                )?;
            },
            None => {
                // table switch: the zero-based key stays on the stack and
                // indexes the branch table, written in key order
                let depths: Vec<u32> = data.targets.iter().map(|&t| depth_of(t)).collect();
                self.tree.add_child(
                    innermost,
                    BranchNode::leaf(
                        span.start,
                        NodeData::Table {
                            depths,
                            targets: data.targets.clone(),
                            default_depth: depth_of(data.default),
                            default_target: data.default,
                            pos: span.start,
                        },
                        span.line,
                    ),
                )?;
            },
        }

        for &block in &blocks {
            self.calculate_region(block)?;
        }
        Ok(())
    }

    // TRY / CATCH
    // --------------------------------------------------------------------------------------------

    /// Emits `try`/`catch` siblings with a dispatch block at the handler
    /// position: the caught reference is spilled once, tested against each
    /// typed clause, and rethrown when nothing matches. Untyped (finally)
    /// clauses branch unconditionally. Without exception-handling support a
    /// single unreachable is injected per handler instead.
    fn calculate_try(&mut self, parent: NodeId, span: Span, data: TryData) -> Result<(), FlowError> {
        if !self.options.use_eh() {
            for h in &data.handlers {
                let stub = Instruction::new(InstrOp::Block(BlockOp::Unreachable), h.pc, span.line);
                self.tree
                    .add_child(parent, BranchNode::leaf(h.pc, NodeData::Inject(vec![stub]), span.line))?;
            }
            return Ok(());
        }

        let h1 = data.handlers[0].pc;
        log::trace!("try [{}, {h1}) with {} handlers, catch ends {}", span.start, data.handlers.len(), data.catch_end);
        let try_node = self.tree.add_child(
            parent,
            BranchNode::region(RegionKind::Try, span.start, h1, span.line),
        )?;
        let catch_node = self.tree.add_child(
            parent,
            BranchNode::region(RegionKind::Catch, h1, data.catch_end, span.line),
        )?;

        // wrap a block around earlier handlers per additional handler, so
        // each one is reachable by a single branch out of the dispatch
        let mut levels: Vec<NodeId> = Vec::with_capacity(data.handlers.len());
        let mut level = catch_node;
        for h in data.handlers.iter().skip(1).rev() {
            level = self.tree.add_child(
                level,
                BranchNode::region(RegionKind::Block, h1, h.pc, span.line),
            )?;
            levels.push(level);
        }
        let dispatch = self.tree.add_child(
            level,
            BranchNode::region(RegionKind::Block, h1, h1, span.line),
        )?;

        let typed = data.handlers.iter().any(|h| h.class.is_some());
        let mut prologue: Vec<Instruction> = Vec::new();
        let slot = if typed {
            let slot = self.locals.temp(ValueType::ExnRef);
            prologue.push(Instruction::new(
                InstrOp::Local { kind: LocalKind::Set, slot, ty: ValueType::ExnRef },
                h1,
                span.line,
            ));
            Some(slot)
        } else {
            // the caught value is dropped unused
            prologue.push(Instruction::new(InstrOp::Drop, h1, span.line));
            None
        };
        self.tree
            .add_child(dispatch, BranchNode::leaf(h1, NodeData::Inject(prologue), span.line))?;

        let mut terminated = false;
        for (k, h) in data.handlers.iter().enumerate() {
            match (&h.class, slot) {
                (Some(class), Some(slot)) => {
                    let class_idx = self.options.types.struct_id(class).as_u32();
                    let test = vec![
                        Instruction::new(
                            InstrOp::Local { kind: LocalKind::Get, slot, ty: ValueType::ExnRef },
                            h1,
                            span.line,
                        ),
                        Instruction::new(
                            InstrOp::Const(weft_core::ConstVal::I32(class_idx as i32)),
                            h1,
                            span.line,
                        ),
                        Instruction::new(InstrOp::Call(self.options.instance_of()), h1, span.line),
                    ];
                    self.tree
                        .add_child(dispatch, BranchNode::leaf(h1, NodeData::Inject(test), span.line))?;
                    self.tree.add_child(
                        dispatch,
                        BranchNode::leaf(
                            h1,
                            NodeData::Branch {
                                op: BranchOp::BrIf,
                                depth: k as u32,
                                target: h.pc,
                                pos: h1,
                            },
                            span.line,
                        ),
                    )?;
                },
                _ => {
                    self.tree.add_child(
                        dispatch,
                        BranchNode::leaf(
                            h1,
                            NodeData::Branch {
                                op: BranchOp::Br,
                                depth: k as u32,
                                target: h.pc,
                                pos: h1,
                            },
                            span.line,
                        ),
                    )?;
                    terminated = true;
                    break;
                },
            }
        }
        if !terminated && let Some(slot) = slot {
            let rethrow = vec![
                Instruction::new(
                    InstrOp::Local { kind: LocalKind::Get, slot, ty: ValueType::ExnRef },
                    h1,
                    span.line,
                ),
                Instruction::new(InstrOp::Block(BlockOp::Throw), h1, span.line),
            ];
            self.tree
                .add_child(dispatch, BranchNode::leaf(h1, NodeData::Inject(rethrow), span.line))?;
        }

        self.calculate_region(try_node)?;
        for &lvl in levels.iter().rev() {
            self.calculate_region(lvl)?;
        }
        self.calculate_region(catch_node)
    }
}

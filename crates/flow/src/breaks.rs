use alloc::vec::Vec;

use weft_core::{ConstVal, InstrOp, Instruction, InstructionList};

use crate::{
    error::FlowError,
    tree::{BranchNode, BranchOp, NodeData, NodeId, RegionKind, RegionTree},
};

// BREAK RECORDS
// ================================================================================================

/// A pending outward jump, queued by the tree builder and materialized by
/// the second pass.
#[derive(Debug, Clone)]
pub(crate) struct BreakBlock {
    pub op: BranchOp,
    /// The region that contained the jump when it was queued.
    pub branch: NodeId,
    /// Position of the jump instruction.
    pub break_pos: u32,
    /// Absolute position the jump lands at.
    pub end_position: u32,
    pub line: u32,
}

// BREAK RESOLVER
// ================================================================================================

/// Resolves every pending break in insertion order.
pub(crate) fn resolve_all(
    tree: &mut RegionTree,
    breaks: Vec<BreakBlock>,
    instrs: &mut InstructionList,
) -> Result<(), FlowError> {
    for bk in breaks {
        resolve(tree, &bk, instrs)?;
    }
    Ok(())
}

/// Finds the shallowest enclosing region whose exit matches the break's
/// target, synthesizing a middle block when no region provides it, then
/// emits the relative-depth branch.
///
/// A break whose target is the start of an else arm is retargeted to the
/// sibling `if`, and the branch delivers a selecting `0` so the `if` marker
/// routes into the else arm; symmetrically, a break entering a then arm
/// delivers a `1`.
fn resolve(
    tree: &mut RegionTree,
    bk: &BreakBlock,
    instrs: &mut InstructionList,
) -> Result<(), FlowError> {
    let mut target = bk.end_position;
    let mut select: Option<i32> = None;

    // middle-block synthesis and else-retargeting both restart the walk; the
    // tree only ever gains the needed exit, so this converges quickly
    let mut rounds = 0;
    let deep = loop {
        rounds += 1;
        if rounds > 16 {
            return Err(FlowError::UnresolvedBreak { pos: bk.break_pos, target });
        }

        let mut node = tree.deepest_containing(bk.branch, bk.break_pos);
        let mut deep = 0u32;
        while tree.effective_end(node) < target {
            match tree.node(node).parent() {
                Some(p) => {
                    node = p;
                    deep += 1;
                },
                None => return Err(FlowError::UnresolvedBreak { pos: bk.break_pos, target }),
            }
        }
        // a break out of a loop targets the wrapping block, not the loop
        if tree.node(node).kind == RegionKind::Loop && tree.node(node).end_pos == target {
            node = tree
                .node(node)
                .parent()
                .ok_or(FlowError::UnresolvedBreak { pos: bk.break_pos, target })?;
            deep += 1;
        }
        if tree.effective_end(node) == target {
            break deep;
        }

        // the target falls strictly inside this region
        if target == tree.node(node).end_pos {
            // a jump into a sibling arm (catch or else interior) has no
            // structural expression
            return Err(FlowError::UnresolvedBreak { pos: bk.break_pos, target });
        }
        match tree.child_starting_at(node, target) {
            Some(child) if select.is_none() && tree.node(child).kind == RegionKind::Else => {
                let if_sibling = tree
                    .prev_sibling(child)
                    .filter(|&s| tree.node(s).kind == RegionKind::If)
                    .ok_or(FlowError::UnresolvedBreak { pos: bk.break_pos, target })?;
                target = tree.node(if_sibling).start_pos;
                select = Some(0);
                log::trace!("break at {} selects the else arm via {}", bk.break_pos, target);
            },
            Some(child) if select.is_none() && tree.node(child).kind == RegionKind::If => {
                select = Some(1);
                log::trace!("break at {} selects the then arm at {}", bk.break_pos, target);
                tree.insert_middle(node, target, bk.line)?;
            },
            _ => {
                tree.insert_middle(node, target, bk.line)?;
            },
        }
    };

    let parent = tree.deepest_containing(bk.branch, bk.break_pos);
    match (bk.op, select) {
        (BranchOp::BrIf, Some(value)) => {
            // the jump enters an arm of a structural if: the break becomes a
            // conditional region delivering the arm-selecting constant, so
            // the target's `if` marker finds its condition on the stack
            let guard = tree.add_child(
                parent,
                BranchNode::region(RegionKind::If, bk.break_pos + 1, bk.break_pos + 1, bk.line),
            )?;
            tree.add_child(
                guard,
                BranchNode::leaf(
                    bk.break_pos + 1,
                    NodeData::Inject(vec![Instruction::new(
                        InstrOp::Const(ConstVal::I32(value)),
                        bk.break_pos,
                        bk.line,
                    )]),
                    bk.line,
                ),
            )?;
            tree.add_child(
                guard,
                BranchNode::leaf(
                    bk.break_pos + 1,
                    NodeData::Branch {
                        op: BranchOp::Br,
                        depth: deep + 1,
                        target,
                        pos: bk.break_pos,
                    },
                    bk.line,
                ),
            )?;
        },
        (BranchOp::Br, Some(value)) => {
            let idx = instrs.upper_bound(bk.break_pos);
            instrs.insert(
                idx,
                Instruction::new(InstrOp::Const(ConstVal::I32(value)), bk.break_pos, bk.line),
            );
            tree.add_child(
                parent,
                BranchNode::leaf(
                    bk.break_pos + 1,
                    NodeData::Branch { op: bk.op, depth: deep, target, pos: bk.break_pos },
                    bk.line,
                ),
            )?;
        },
        (_, None) => {
            tree.add_child(
                parent,
                BranchNode::leaf(
                    bk.break_pos + 1,
                    NodeData::Branch { op: bk.op, depth: deep, target, pos: bk.break_pos },
                    bk.line,
                ),
            )?;
        },
    }
    Ok(())
}

use alloc::vec::Vec;

use weft_core::{
    BlockOp, BlockType, BrTable, InstrOp, Instruction, InstructionList, TypeTable, ValueType,
};

use crate::tree::{BranchOp, EndOp, NodeData, NodeId, RegionTree, StartOp};

// EMITTER
// ================================================================================================

/// Walks the bytecode position axis, interleaving the straight-line
/// instructions with the structural markers and injected sequences of the
/// region tree. Straight-line instructions are never re-ordered.
pub(crate) fn interleave(tree: &RegionTree, input: InstructionList) -> InstructionList {
    let mut out = InstructionList::new();
    let input = input.into_vec();
    let mut cursor = 0usize;
    emit_node(tree, tree.root_id(), &input, &mut cursor, &mut out);
    while cursor < input.len() {
        out.push(input[cursor].clone());
        cursor += 1;
    }
    out
}

fn emit_node(
    tree: &RegionTree,
    id: NodeId,
    input: &[Instruction],
    cursor: &mut usize,
    out: &mut InstructionList,
) {
    let node = tree.node(id);
    if let Some(op) = node.start_op {
        let marker = match op {
            StartOp::Block => BlockOp::Block(BlockType::Empty),
            StartOp::Loop => BlockOp::Loop(BlockType::Empty),
            StartOp::If => BlockOp::If(BlockType::Empty),
            StartOp::Try => BlockOp::Try(BlockType::Empty),
            StartOp::Catch => BlockOp::Catch,
        };
        out.push(Instruction::new(InstrOp::Block(marker), node.start_pos, node.line));
    }
    match &node.data {
        NodeData::Inject(seq) => {
            for instr in seq {
                out.push(instr.clone());
            }
        },
        NodeData::Branch { op, depth, pos, .. } => {
            let br = match op {
                BranchOp::Br => BlockOp::Br(*depth),
                BranchOp::BrIf => BlockOp::BrIf(*depth),
            };
            out.push(Instruction::new(InstrOp::Block(br), *pos, node.line));
        },
        NodeData::Table { depths, default_depth, pos, .. } => {
            let table = BrTable { depths: depths.clone(), default: *default_depth };
            out.push(Instruction::new(InstrOp::Block(BlockOp::BrTable(table)), *pos, node.line));
        },
        NodeData::None => {},
    }
    for &child in node.children() {
        let bound = tree.node(child).start_pos;
        copy_while(input, cursor, out, bound);
        emit_node(tree, child, input, cursor, out);
    }
    copy_while(input, cursor, out, node.end_pos);
    if let Some(op) = node.end_op {
        let marker = match op {
            EndOp::End => BlockOp::End,
            EndOp::Else => BlockOp::Else,
        };
        out.push(Instruction::new(InstrOp::Block(marker), node.end_pos, node.line));
    }
}

fn copy_while(input: &[Instruction], cursor: &mut usize, out: &mut InstructionList, bound: u32) {
    while *cursor < input.len() && input[*cursor].code_position < bound {
        out.push(input[*cursor].clone());
        *cursor += 1;
    }
}

// BLOCK TYPE INFERENCE
// ================================================================================================

/// Infers the result signature of every `block` and `if` marker bottom-up by
/// simulating the operand stack over the region interior, skipping nested
/// regions via their already-inferred signatures.
pub(crate) fn infer_block_types(list: &mut InstructionList, types: &mut TypeTable) {
    let opens: Vec<usize> = list
        .iter()
        .enumerate()
        .filter_map(|(idx, instr)| match instr.op {
            InstrOp::Block(BlockOp::Block(_)) | InstrOp::Block(BlockOp::If(_)) => Some(idx),
            _ => None,
        })
        .collect();
    // later markers open deeper (or later) regions; processing them first
    // makes every nested signature available to its enclosing simulation
    for &idx in opens.iter().rev() {
        let results = simulate(list, idx, types);
        let ty = match results.as_slice() {
            [] => BlockType::Empty,
            [single] => BlockType::Result(*single),
            many => BlockType::Func(types.block_type(&[], many)),
        };
        match &mut list.get_mut(idx).expect("marker index").op {
            InstrOp::Block(BlockOp::Block(slot)) | InstrOp::Block(BlockOp::If(slot)) => {
                *slot = ty;
            },
            _ => unreachable!("filtered to block and if markers"),
        }
    }
}

/// Simulates the abstract operand stack from the marker at `open` to the
/// first terminator at its nesting level and returns the remaining stack.
///
/// A region left through a return, a rethrow, or a branch past its own end
/// never falls through, so its own signature stays empty.
fn simulate(list: &InstructionList, open: usize, types: &TypeTable) -> Vec<ValueType> {
    let mut stack: Vec<ValueType> = Vec::new();
    let mut j = open + 1;
    while let Some(instr) = list.get(j) {
        match &instr.op {
            InstrOp::Block(op) => match op {
                BlockOp::Block(ty)
                | BlockOp::Loop(ty)
                | BlockOp::If(ty)
                | BlockOp::Try(ty) => {
                    for _ in 0..instr.pop_count() {
                        stack.pop();
                    }
                    j = matching_end(list, j);
                    push_block_type(*ty, &mut stack, types);
                },
                BlockOp::End | BlockOp::Else => return stack,
                BlockOp::Br(depth) => {
                    // a branch to this region's own end carries its result
                    return if *depth == 0 { stack } else { Vec::new() };
                },
                BlockOp::Return
                | BlockOp::Unreachable
                | BlockOp::Throw
                | BlockOp::Rethrow
                | BlockOp::BrTable(_) => return Vec::new(),
                BlockOp::BrIf(_) => {
                    stack.pop();
                },
                BlockOp::Catch => stack.push(ValueType::ExnRef),
            },
            _ => {
                for _ in 0..instr.pop_count() {
                    stack.pop();
                }
                if let Some(ty) = instr.push_type() {
                    stack.push(ty);
                }
            },
        }
        j += 1;
    }
    stack
}

/// Index of the `end` closing the marker at `open`.
fn matching_end(list: &InstructionList, open: usize) -> usize {
    let mut depth = 0usize;
    let mut j = open + 1;
    while let Some(instr) = list.get(j) {
        match &instr.op {
            InstrOp::Block(BlockOp::Block(_))
            | InstrOp::Block(BlockOp::Loop(_))
            | InstrOp::Block(BlockOp::If(_))
            | InstrOp::Block(BlockOp::Try(_)) => depth += 1,
            InstrOp::Block(BlockOp::End) => {
                if depth == 0 {
                    return j;
                }
                depth -= 1;
            },
            _ => {},
        }
        j += 1;
    }
    list.len()
}

fn push_block_type(ty: BlockType, stack: &mut Vec<ValueType>, types: &TypeTable) {
    match ty {
        BlockType::Empty => {},
        BlockType::Result(t) => stack.push(t),
        BlockType::Func(id) => stack.extend(types.sig(id).results.iter().copied()),
    }
}

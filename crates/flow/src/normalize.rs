use alloc::{collections::BTreeMap, vec::Vec};

use smallvec::SmallVec;
use weft_core::{CompareOp, InstrOp, Instruction, InstructionList};

use crate::{
    error::FlowError,
    parsed::{
        Handler, LoopData, LoopShape, ParsedBlock, ParsedOp, Span, TryData, TryRow, sort_blocks,
    },
};

// INSTRUCTION REWRITES
// ================================================================================================

/// Negates the comparison instruction at `pos` in place.
///
/// The decoder emits the comparison as the first instruction at the jump's
/// position, so the first slot there must carry a comparison operator.
pub(crate) fn negate_compare_at(
    instrs: &mut InstructionList,
    pos: u32,
    line: u32,
) -> Result<(), FlowError> {
    let idx = instrs.find_position(pos).ok_or(FlowError::NotACompare { pos, line })?;
    instrs
        .get_mut(idx)
        .expect("index just found")
        .negate_compare()
        .map_err(|_| FlowError::NotACompare { pos, line })
}

/// Returns the negated operator of the comparison at `pos` without touching
/// the list; used by tests and diagnostics.
#[allow(dead_code)]
pub(crate) fn compare_at(instrs: &InstructionList, pos: u32) -> Option<CompareOp> {
    instrs.iter().find_map(|i| match i.op {
        InstrOp::Compare(op) if i.code_position == pos => Some(op),
        _ => None,
    })
}

/// Removes the placeholder jump a registered conditional left at `pos`.
pub(crate) fn remove_placeholder_at(
    instrs: &mut InstructionList,
    pos: u32,
) -> Result<(), FlowError> {
    let idx = instrs
        .iter()
        .position(|i| i.code_position == pos && matches!(i.op, InstrOp::Jump))
        .ok_or(FlowError::MissingInstruction { pos })?;
    instrs.remove(idx);
    Ok(())
}

// NORMALIZER
// ================================================================================================

/// Runs the three normalization sub-phases over the parsed store: try-region
/// bounds, loop discovery and idiom rewrites, and the final sort.
pub(crate) fn run(
    parsed: &mut Vec<ParsedBlock>,
    rows: &[TryRow],
    instrs: &mut InstructionList,
    code_size: u32,
    use_eh: bool,
) -> Result<(), FlowError> {
    try_region_bounds(parsed, rows, code_size, use_eh);
    sort_blocks(parsed);
    collapse_empty_then(parsed, instrs)?;
    discover_loops(parsed, instrs)?;
    sort_blocks(parsed);
    log::debug!("normalized {} parsed blocks", parsed.len());
    Ok(())
}

// PHASE A - TRY REGION BOUNDS
// ================================================================================================

/// Coalesces exception-table rows sharing a protected range into one region
/// per range, computes each region's catch end, and registers the regions as
/// parsed blocks.
///
/// The catch end is the target of the compensating goto the source emits
/// right before the first handler; failing that, the smallest end of any
/// parsed block still enclosing the handler; failing that, the method end.
/// With exception handling enabled the compensating goto is dropped, since
/// normal completion of a try body skips its handlers structurally.
fn try_region_bounds(
    parsed: &mut Vec<ParsedBlock>,
    rows: &[TryRow],
    code_size: u32,
    use_eh: bool,
) {
    let mut regions: Vec<(u32, u32, SmallVec<[Handler; 2]>)> = Vec::new();
    for row in rows {
        match regions.iter_mut().find(|(s, e, _)| *s == row.start_pc && *e == row.end_pc) {
            Some((_, _, handlers)) => handlers.push(Handler {
                pc: row.handler_pc,
                class: row.catch_type.clone(),
            }),
            None => regions.push((
                row.start_pc,
                row.end_pc,
                smallvec::smallvec![Handler {
                    pc: row.handler_pc,
                    class: row.catch_type.clone(),
                }],
            )),
        }
    }

    for (start, body_end, handlers) in regions {
        let h1 = handlers[0].pc;
        let compensating = parsed.iter().position(|b| {
            matches!(b.op, ParsedOp::Goto)
                && h1 >= 3
                && b.span.start == h1 - 3
                && b.span.end > h1
        });
        let catch_end = match compensating {
            Some(idx) => {
                let end = parsed[idx].span.end;
                if use_eh {
                    parsed.remove(idx);
                }
                end
            },
            None => parsed
                .iter()
                .filter(|b| b.span.start <= h1 && b.span.end > h1)
                .map(|b| b.span.end)
                .min()
                .unwrap_or(code_size)
                .min(code_size),
        };
        log::trace!("try region [{start}, {body_end}) handlers at {h1}.. closes at {catch_end}");
        parsed.push(ParsedBlock {
            op: ParsedOp::Try(TryData { body_end, handlers, catch_end }),
            span: Span { start, end: catch_end, next: body_end, line: 0 },
        });
    }
}

// PHASE B - LOOPS AND JUMP IDIOMS
// ================================================================================================

/// Collapses the empty-then idiom: a conditional jump immediately followed by
/// a goto it guards (`if start == if.next` and `goto.next == if.end`) folds
/// into a single negated conditional spanning the goto's extent.
fn collapse_empty_then(
    parsed: &mut Vec<ParsedBlock>,
    instrs: &mut InstructionList,
) -> Result<(), FlowError> {
    let mut i = 0;
    while i + 1 < parsed.len() {
        let fold = match (&parsed[i], &parsed[i + 1]) {
            (
                ParsedBlock { op: ParsedOp::If(data), span },
                ParsedBlock { op: ParsedOp::Goto, span: gspan },
            ) if span.end > span.start
                && gspan.start == span.next
                && gspan.next == span.end =>
            {
                Some((data.compare_pos, span.line, gspan.end))
            },
            _ => None,
        };
        if let Some((compare_pos, line, new_end)) = fold {
            negate_compare_at(instrs, compare_pos, line)?;
            parsed[i].span.end = new_end;
            parsed.remove(i + 1);
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// Walks the parsed store left to right, materializing a loop region at the
/// target of every backward jump and rewriting the goto-to-tail-condition
/// idiom into a head-tested loop.
///
/// A loop's span starts at the back-jump target and is expanded to include
/// every back-jump's fall-through, then further while any overlapping
/// outward conditional, switch body, or try region would otherwise break
/// strict nesting: loops absorb overlaps.
fn discover_loops(
    parsed: &mut Vec<ParsedBlock>,
    instrs: &mut InstructionList,
) -> Result<(), FlowError> {
    let mut removed = vec![false; parsed.len()];
    let mut loop_ends: BTreeMap<u32, u32> = BTreeMap::new();
    let mut while_loops: Vec<ParsedBlock> = Vec::new();

    for i in 0..parsed.len() {
        if removed[i] {
            continue;
        }
        match &parsed[i].op {
            ParsedOp::Goto | ParsedOp::If(_) if parsed[i].is_backward() => {
                let target = parsed[i].span.end;
                let mut end = parsed[i].span.next.max(loop_ends.get(&target).copied().unwrap_or(0));
                end = absorb_overlaps(parsed, &removed, target, end);
                log::trace!("loop at {target} extends to {end}");
                loop_ends.insert(target, end);
            },
            ParsedOp::Goto => {
                // a forward goto straight to a later backward conditional is
                // a while loop compiled as goto-to-condition
                let g = parsed[i].span;
                let tail = (i + 1..parsed.len()).find(|&j| {
                    !removed[j]
                        && matches!(parsed[j].op, ParsedOp::If(_))
                        && parsed[j].span.end == g.next
                });
                if let Some(j) = tail {
                    let cond = match &parsed[j].op {
                        ParsedOp::If(data) => (data.compare_pos, parsed[j].span),
                        _ => unreachable!("filtered to conditionals"),
                    };
                    rewrite_while(instrs, g, cond.0, cond.1, &mut while_loops)?;
                    removed[i] = true;
                    removed[j] = true;
                }
            },
            _ => {},
        }
    }

    let mut keep = removed.iter().map(|r| !*r);
    parsed.retain(|_| keep.next().unwrap());

    for (target, end) in loop_ends {
        parsed.push(ParsedBlock {
            op: ParsedOp::Loop(LoopData { continue_pos: target, shape: LoopShape::Plain }),
            span: Span { start: target, end, next: target, line: 0 },
        });
    }
    parsed.append(&mut while_loops);
    Ok(())
}

/// One in-order sweep expanding a loop's end over everything that overlaps
/// it: an outward-pointing conditional starting inside, a switch whose cases
/// reach past the tail, or a try region whose catch end exceeds the tail.
fn absorb_overlaps(parsed: &[ParsedBlock], removed: &[bool], start: u32, mut end: u32) -> u32 {
    for (b, flag) in parsed.iter().zip(removed) {
        if *flag || b.span.start < start || b.span.start >= end {
            continue;
        }
        match &b.op {
            ParsedOp::If(_) if !b.is_backward() && b.span.end > end => end = b.span.end,
            ParsedOp::Switch(data) => {
                let last = data.targets.iter().copied().chain([data.default]).max();
                if let Some(last) = last
                    && last > end
                {
                    end = last;
                }
            },
            ParsedOp::Try(data) if data.catch_end > end => end = data.catch_end,
            _ => {},
        }
    }
    end
}

/// Rewrites one goto-to-condition loop: negates the tail conditional, hoists
/// the condition instructions to the loop head, and plants the conditional
/// exit and the unconditional back-edge.
fn rewrite_while(
    instrs: &mut InstructionList,
    goto: Span,
    compare_pos: u32,
    tail: Span,
    while_loops: &mut Vec<ParsedBlock>,
) -> Result<(), FlowError> {
    negate_compare_at(instrs, compare_pos, tail.line)?;

    let moved: Vec<Instruction> = instrs
        .drain_positions(goto.end, tail.next)
        .into_iter()
        .filter(|i| !matches!(i.op, InstrOp::Jump))
        .collect();
    if moved.is_empty() {
        return Err(FlowError::LostLoopCondition { line: goto.line });
    }
    let mut at = instrs.lower_bound(goto.start);
    for mut instr in moved {
        instr.code_position = goto.start;
        instrs.insert(at, instr);
        at += 1;
    }
    log::trace!("hoisted while condition from {} to {}", goto.end, goto.start);

    while_loops.push(ParsedBlock {
        op: ParsedOp::Loop(LoopData {
            continue_pos: goto.start,
            shape: LoopShape::While { exit_pos: goto.start + 1, back_edge: tail.start },
        }),
        span: Span { start: goto.start, end: tail.next, next: goto.start, line: goto.line },
    });
    Ok(())
}

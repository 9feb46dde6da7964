use alloc::{string::String, vec::Vec};

use smallvec::SmallVec;

// METHOD CODE
// ================================================================================================

/// One row of the source method's exception table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryRow {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    /// The declared class of the caught exception; `None` for the catch-all
    /// rows a finally clause produces.
    pub catch_type: Option<String>,
}

/// The per-method facts captured at `reset`: the code size and the exception
/// table.
#[derive(Debug, Clone, Default)]
pub struct MethodCode {
    pub size: u32,
    pub exception_table: Vec<TryRow>,
}

// PARSED BLOCKS
// ================================================================================================

/// Position data common to every parsed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    /// Byte offset of the jump instruction itself.
    pub start: u32,
    /// Target byte offset. For returns, a sentinel past any real position.
    pub end: u32,
    /// Byte offset of the instruction following the jump in decode order.
    pub next: u32,
    /// Source line for diagnostics.
    pub line: u32,
}

/// Sentinel `end` of a return record.
pub(crate) const RETURN_END: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IfData {
    /// Position of the comparison instruction feeding this jump. The decoder
    /// emits the comparison at the jump's own position, so this equals the
    /// record's `start`.
    pub compare_pos: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SwitchData {
    /// Sorted match keys of a lookup switch; absent for a table switch.
    pub keys: Option<Vec<i32>>,
    /// Case targets, parallel to `keys` (or to the zero-based table index).
    pub targets: Vec<u32>,
    pub default: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Handler {
    pub pc: u32,
    pub class: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TryData {
    /// End of the protected range.
    pub body_end: u32,
    /// Handlers coalesced onto this region, in registration order.
    pub handlers: SmallVec<[Handler; 2]>,
    /// One past the last handler's body; bounds the catch region.
    pub catch_end: u32,
}

/// How a synthesized loop came to be; head-tested loops rewritten from the
/// goto-to-condition idiom carry their planted branch positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopShape {
    Plain,
    While { exit_pos: u32, back_edge: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoopData {
    pub continue_pos: u32,
    pub shape: LoopShape,
}

/// Operation-specific payload of a parsed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParsedOp {
    Goto,
    If(IfData),
    Switch(SwitchData),
    Try(TryData),
    Loop(LoopData),
    Return,
}

/// One jump-bearing instruction of the source method, as registered by the
/// decoder (or synthesized by the loop detector).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedBlock {
    pub op: ParsedOp,
    pub span: Span,
}

impl ParsedBlock {
    pub fn is_backward(&self) -> bool {
        self.span.end < self.span.start
    }
}

/// Sorts records by start ascending, ties broken by end descending so outer
/// regions precede inner regions starting at the same offset.
pub(crate) fn sort_blocks(blocks: &mut [ParsedBlock]) {
    blocks.sort_by(|a, b| {
        a.span.start.cmp(&b.span.start).then_with(|| b.span.end.cmp(&a.span.end))
    });
}

use alloc::{collections::VecDeque, string::String, vec::Vec};
use core::mem;

use weft_core::{InstrOp, Instruction, InstructionList, ValueType};

use crate::{
    breaks::{self, BreakBlock},
    builder::Builder,
    emit,
    error::FlowError,
    normalize,
    options::{LocalAllocator, TranslationOptions},
    parsed::{IfData, MethodCode, ParsedBlock, ParsedOp, RETURN_END, Span, SwitchData, TryRow},
    tree::RegionTree,
};

// BRANCH MANAGER
// ================================================================================================

/// The control-flow reconstruction engine for one method.
///
/// The decoder drives it through a fixed lifecycle: [`Self::reset`] once per
/// method, then the registration calls in bytecode-position order while the
/// straight-line instructions accumulate in the co-owned list, then
/// [`Self::calculate`] to build the region tree and resolve every jump, and
/// finally [`Self::handle`] to interleave the structural markers and infer
/// the block signatures. [`Self::take_instructions`] hands the finished
/// stream back.
///
/// A manager is owned by exactly one method-translation context; everything
/// here is single-threaded and deterministic for identical inputs.
#[derive(Debug)]
pub struct BranchManager {
    options: TranslationOptions,
    locals: LocalAllocator,
    instructions: InstructionList,
    parsed: Vec<ParsedBlock>,
    rows: Vec<TryRow>,
    tree: RegionTree,
    breaks: Vec<BreakBlock>,
    code_size: u32,
    locals_base: u32,
}

/// Constructors
impl BranchManager {
    /// Returns a new manager over the given collaborators.
    pub fn new(options: TranslationOptions, locals: LocalAllocator) -> Self {
        let locals_base = locals.frame_size();
        Self {
            options,
            locals,
            instructions: InstructionList::new(),
            parsed: Vec::new(),
            rows: Vec::new(),
            tree: RegionTree::new(0),
            breaks: Vec::new(),
            code_size: 0,
            locals_base,
        }
    }
}

/// Lifecycle
impl BranchManager {
    /// Clears all per-method state and captures the method's code size and
    /// exception table. Must be called before any registration, once per
    /// method; calling it twice in a row is equivalent to calling it once.
    pub fn reset(&mut self, code: &MethodCode) {
        self.instructions.clear();
        self.parsed.clear();
        self.breaks.clear();
        self.rows = code.exception_table.clone();
        self.code_size = code.size;
        self.tree = RegionTree::new(code.size);
        self.locals.reset(self.locals_base);
    }

    /// Registers an unconditional jump.
    pub fn add_goto(&mut self, start: u32, offset: i32, next: u32, line: u32) {
        let end = (start as i64 + offset as i64) as u32;
        self.parsed.push(ParsedBlock {
            op: ParsedOp::Goto,
            span: Span { start, end, next, line },
        });
    }

    /// Registers a return; it only serves as a terminator during loop
    /// detection and produces no branch of its own.
    pub fn add_return(&mut self, start: u32, next: u32, line: u32) {
        self.parsed.push(ParsedBlock {
            op: ParsedOp::Return,
            span: Span { start, end: RETURN_END, next, line },
        });
    }

    /// Registers a conditional jump. The comparison instruction must already
    /// sit at `start` in the instruction list; a placeholder jump is added
    /// after it so later passes know which slot the conditional occupies.
    pub fn add_if(&mut self, start: u32, offset: i32, line: u32) {
        let end = (start as i64 + offset as i64) as u32;
        self.instructions.push(Instruction::new(InstrOp::Jump, start, line));
        self.parsed.push(ParsedBlock {
            op: ParsedOp::If(IfData { compare_pos: start }),
            span: Span { start, end, next: start + 3, line },
        });
    }

    /// Registers a switch. `keys` are the sorted match values of a lookup
    /// switch; a table switch passes `None` and zero-based, contiguous case
    /// indices.
    pub fn add_switch(
        &mut self,
        start: u32,
        line: u32,
        keys: Option<Vec<i32>>,
        positions: Vec<u32>,
        default_position: u32,
    ) {
        self.parsed.push(ParsedBlock {
            op: ParsedOp::Switch(SwitchData { keys, targets: positions, default: default_position }),
            span: Span { start, end: default_position, next: start, line },
        });
    }

    /// Registers one exception-table row.
    pub fn add_try(&mut self, row: TryRow) {
        self.rows.push(row);
    }

    /// The instruction list the decoder appends translated instructions to.
    pub fn instructions_mut(&mut self) -> &mut InstructionList {
        &mut self.instructions
    }

    pub fn instructions(&self) -> &InstructionList {
        &self.instructions
    }

    /// Normalizes the parsed operations, builds the region tree, and
    /// resolves every pending break into a relative-depth branch.
    pub fn calculate(&mut self) -> Result<(), FlowError> {
        log::debug!(
            "restructuring {} parsed operations over {} bytes",
            self.parsed.len(),
            self.code_size
        );
        normalize::run(
            &mut self.parsed,
            &self.rows,
            &mut self.instructions,
            self.code_size,
            self.options.use_eh(),
        )?;
        let ops = VecDeque::from(mem::take(&mut self.parsed));
        Builder {
            tree: &mut self.tree,
            breaks: &mut self.breaks,
            instrs: &mut self.instructions,
            options: &mut self.options,
            locals: &mut self.locals,
            ops,
        }
        .run()?;
        breaks::resolve_all(&mut self.tree, mem::take(&mut self.breaks), &mut self.instructions)
    }

    /// Interleaves the structural markers with the straight-line stream and
    /// infers every block's result signature.
    pub fn handle(&mut self) -> Result<(), FlowError> {
        let input = mem::take(&mut self.instructions);
        let mut out = emit::interleave(&self.tree, input);
        emit::infer_block_types(&mut out, &mut self.options.types);
        self.instructions = out;
        Ok(())
    }

    /// Hands the finalized instruction stream back to the caller.
    pub fn take_instructions(&mut self) -> InstructionList {
        mem::take(&mut self.instructions)
    }
}

/// Queries
impl BranchManager {
    /// The static type of the exception caught at the given handler
    /// position, or `None` if no handler begins there. The decoder uses this
    /// to materialize a correctly typed local for the caught reference.
    pub fn catch_type(&mut self, code_position: u32) -> Option<ValueType> {
        let class: Option<String> = self
            .rows
            .iter()
            .find(|r| r.handler_pc == code_position)
            .map(|r| r.catch_type.clone())?;
        match (class, self.options.use_gc()) {
            (Some(class), true) => Some(self.options.types.value_of(&class)),
            _ => Some(ValueType::ExnRef),
        }
    }

    pub fn options(&self) -> &TranslationOptions {
        &self.options
    }
}

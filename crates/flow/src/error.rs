// FLOW ERROR
// ================================================================================================

/// Failure of one method's control-flow reconstruction.
///
/// There is no local recovery: the method is abandoned, but none of the
/// shared collaborators (type table, instruction buffers of other methods)
/// are left in an inconsistent state, so a compiler driver may continue with
/// the next method.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    /// A backward jump whose target is not the head of any enclosing loop.
    /// Raised for irreducible input flow.
    #[error("backward jump to {target} at line {line} does not re-enter an enclosing loop")]
    IrreducibleBackJump { target: u32, line: u32 },

    /// The head-tested loop rewrite found no condition instructions between
    /// the loop entry goto's target and the tail jump.
    #[error("lost the loop condition while rewriting a goto-to-condition loop at line {line}")]
    LostLoopCondition { line: u32 },

    /// A region would overlap one of its siblings. This is an internal
    /// invariant breach of the detector or resolver, not a property of the
    /// input.
    #[error("region [{start}, {end}) would overlap a sibling region")]
    NodeOverlap { start: u32, end: u32 },

    /// An attempt to negate the operator of an instruction that is not a
    /// comparison.
    #[error("instruction at position {pos} (line {line}) is not a comparison and cannot be negated")]
    NotACompare { pos: u32, line: u32 },

    /// An instruction the engine expected to find at a position is missing
    /// from the instruction list.
    #[error("no instruction at position {pos} to rewrite")]
    MissingInstruction { pos: u32 },

    /// A forward jump whose target no enclosing region can provide.
    #[error("break at position {pos} cannot reach target {target}")]
    UnresolvedBreak { pos: u32, target: u32 },
}

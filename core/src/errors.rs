// NEGATION ERROR
// ================================================================================================

/// Error raised when negation is applied to an instruction that carries no
/// comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot negate a non-comparison instruction")]
pub struct NotComparisonError;

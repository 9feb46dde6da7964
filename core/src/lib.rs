#![no_std]

//! Shared data model for the Weft control-flow restructurer.
//!
//! The source machine addresses code by byte position and jumps freely; the
//! target machine expresses control flow only through strictly nested
//! `block`/`loop`/`if`/`try` regions and relative-depth branches. This crate
//! holds everything both sides of that translation agree on: the target
//! instruction forms, the growable position-indexed instruction list the
//! decoder and the restructurer co-own, and the type table that interns
//! structural types and block signatures.

#[macro_use]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

mod errors;
mod instructions;
mod ops;
mod types;

pub use errors::NotComparisonError;
pub use instructions::{
    BlockOp, BrTable, ConstVal, FnRef, InstrKind, InstrOp, Instruction, InstructionList, LocalKind,
};
pub use ops::{ArithOp, CompareOp};
pub use types::{BlockSig, BlockType, BlockTypeId, StructTypeId, TypeTable, ValueType};

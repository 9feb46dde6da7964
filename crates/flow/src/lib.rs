#![no_std]

//! Control-flow reconstruction for the Weft restructurer.
//!
//! The source machine expresses control flow as raw forward and backward
//! jumps over a linear instruction stream; the target machine only knows
//! strictly nested `block`/`loop`/`if`/`try` regions and relative-depth
//! branches. This crate infers, from the jumps alone, where loops begin,
//! where `if`/`else` split and merge, where short-circuit conditions end,
//! where switch cases break out, and where exception handlers live, and
//! rewrites the method into that nested form.
//!
//! The pipeline behind [`BranchManager`] runs in fixed phases:
//!
//! 1. the parsed-operation store collects one record per jump-bearing
//!    instruction as the decoder sweeps the method;
//! 2. the loop detector materializes loop regions at back-jump targets and
//!    normalizes the jump idioms the source compiler emits;
//! 3. the region tree builder turns the sorted records into a tree of
//!    nested regions;
//! 4. the break resolver turns every deferred outward jump into a
//!    relative-depth branch, synthesizing middle blocks where no region
//!    provides the needed target;
//! 5. the emitter interleaves structural markers with the straight-line
//!    instructions and infers each region's result signature.

#[macro_use]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

mod breaks;
mod builder;
mod emit;
mod error;
mod manager;
mod normalize;
mod options;
mod parsed;
mod tree;

pub use error::FlowError;
pub use manager::BranchManager;
pub use options::{LocalAllocator, TranslationOptions};
pub use parsed::{MethodCode, TryRow};

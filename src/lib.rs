//! Chaitin-Briggs graph-coloring register allocation library.
//!
//! This crate implements a global register allocator for a late-stage CFG of
//! machine instructions: iterative liveness, interference-graph construction
//! with register-pressure tracking, aggressive and conservative copy
//! coalescing, base-pointer stretching across safepoints, Briggs-style
//! simplify/select coloring, live-range splitting when coloring fails, and a
//! post-allocation peephole pass that removes copies the coloring made
//! redundant.
//!
//! The machine description is abstract: callers supply a [`isa::TargetIsa`]
//! implementation describing registers, masks and save policies, and a CFG of
//! [`ir::Function`] nodes already matched to target operations.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use cranelift_entity as entity;

pub mod indexset;
pub mod ir;
pub mod isa;
pub mod regalloc;

mod result;

pub use crate::entity::packed_option;
pub use crate::result::{CodegenError, CodegenResult};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Compiler core and runtime scheduler for a visual-programming generative
//! animation system: users wire blocks into a patch, this crate compiles
//! the patch into an IR program, and a per-frame executor runs that program.
//!
//! Dependency order (leaves first): types → ir → patch → registry →
//! compiler → runtime. `diagnostics` and `tap` are orthogonal services with
//! no back-edge into the pipeline.

pub mod address;
pub mod blocks;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod expr;
pub mod idx;
pub mod ir;
pub mod patch;
pub mod registry;
pub mod runtime;
pub mod tap;
pub mod types;

pub use address::{AddressRegistry, CanonicalAddress};
pub use compiler::{compile, CompileOptions, CompileResult};
pub use diagnostics::{Diagnostic, DiagnosticAction, PatchEditor};
pub use error::InternalError;
pub use ir::IRProgram;
pub use patch::{Block, Edge, Patch};
pub use registry::BlockRegistry;
pub use runtime::{RenderPass, Runtime};
pub use tap::{DebugGraph, DebugService, DebugTap, RingBufferTap};

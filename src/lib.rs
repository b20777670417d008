//! gradix — an optimizing backend for straight-line matrix-computation IR.
//!
//! A higher-level graph compiler turns a network topology and a
//! [`ComputationRequest`](compiler::ComputationRequest) into an initial,
//! correctness-first [`Computation`](ir::Computation): an ordered command
//! sequence over matrices, with no branches. This crate rewrites that
//! computation through a fixed pipeline of analysis and optimization passes
//! that never change its numeric result while reducing memory traffic and
//! allocation count:
//!
//! 1. variable merging (in-place execution, redundant-copy removal)
//! 2. model-update consolidation (recurrent architectures)
//! 3. zero-init elimination
//! 4. sizing-command motion
//! 5. allocation reuse
//!
//! [`compiler::CachingCompiler`] wraps the pipeline with a single-entry
//! result cache keyed on request equality. The whole pipeline is
//! synchronous, single-threaded, deterministic compile-time work.

pub mod analysis;
pub mod compiler;
pub mod error;
pub mod ir;
pub mod optimize;

pub use compiler::{CachingCompiler, ComputationBuilder, ComputationRequest};
pub use error::Error;
pub use ir::Computation;
pub use optimize::{optimize, OptimizeConfig};

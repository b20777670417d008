//! Cached compile-and-optimize.
//!
//! The graph compiler that turns a network topology and a request into an
//! initial, correctness-first computation is an external collaborator; it
//! plugs in through the [`ComputationBuilder`] trait. [`CachingCompiler`]
//! wraps a builder with the optimization pipeline and a single-entry result
//! cache keyed on request value equality, so a tight loop recompiling the
//! same request costs one compile, not N.
//!
//! One compiler instance per thread is the expected usage; sharing one
//! instance across threads requires external serialization.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ir::Computation;
use crate::optimize::{optimize, OptimizeConfig};

/// One named input or output of a computation, with the time indices at
/// which it is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoSpec {
    pub name: String,
    /// Time indices, in the order the executor feeds or reads them.
    pub indices: Vec<i32>,
}

/// The cache key: what the caller wants computed. Two requests are equal iff
/// every field compares equal; equality, not identity, drives cache hits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputationRequest {
    pub inputs: Vec<IoSpec>,
    pub outputs: Vec<IoSpec>,
    /// Whether the backward pass must produce parameter derivatives.
    pub need_model_derivative: bool,
    /// Whether forward ops should store per-component statistics.
    pub store_component_stats: bool,
}

/// The external graph compiler: produces the initial, unoptimized
/// computation for a request.
pub trait ComputationBuilder {
    fn build(&self, request: &ComputationRequest) -> Result<Computation, Error>;
}

/// Builds, optimizes, and freezes computations, retaining exactly one
/// `(request, computation)` pair. Replacement, not an LRU: a request that
/// differs from the cached one in any field evicts it.
pub struct CachingCompiler<B> {
    builder: B,
    config: OptimizeConfig,
    cached: Option<(ComputationRequest, Computation)>,
}

impl<B: ComputationBuilder> CachingCompiler<B> {
    pub fn new(builder: B) -> CachingCompiler<B> {
        CachingCompiler::with_config(builder, OptimizeConfig::default())
    }

    pub fn with_config(builder: B, config: OptimizeConfig) -> CachingCompiler<B> {
        CachingCompiler {
            builder,
            config,
            cached: None,
        }
    }

    /// Compile `request`, or return the cached result unchanged if the
    /// stored request compares equal. The returned computation is owned by
    /// the cache and valid until the next `compile` call on this instance.
    pub fn compile(&mut self, request: &ComputationRequest) -> Result<&Computation, Error> {
        let hit = matches!(&self.cached, Some((cached, _)) if cached == request);
        if !hit {
            let mut computation = self.builder.build(request)?;
            optimize(&self.config, &mut computation)?;
            computation.freeze()?;
            self.cached = Some((request.clone(), computation));
        }
        match &self.cached {
            Some((_, computation)) => Ok(computation),
            None => unreachable!("the cache slot was just filled"),
        }
    }
}

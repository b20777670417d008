use thiserror::Error;

/// Errors produced while compiling or rewriting a computation.
///
/// Unsafe rewrite *candidates* are never errors: a pass that cannot prove a
/// candidate safe simply skips it. Errors signal either a violated pipeline
/// contract or a structurally invalid computation, and both abort compilation.
#[derive(Debug, Error)]
pub enum Error {
    /// Model-update consolidation was invoked on a computation it already ran
    /// on. The pass is a one-shot, non-idempotent rewrite.
    #[error("model-update consolidation has already been applied to this computation")]
    AlreadyConsolidated,

    /// The computation violates a structural invariant (dangling id, missing
    /// or duplicated sizing command, access outside a matrix's live window).
    #[error("malformed computation: {0}")]
    Check(String),

    /// The computation builder could not produce an initial computation for
    /// the request.
    #[error("computation builder failed: {0}")]
    Build(String),
}

impl Error {
    pub(crate) fn check(msg: impl Into<String>) -> Error {
        Error::Check(msg.into())
    }
}

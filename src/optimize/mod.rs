//! The optimization pipeline.
//!
//! Runs rewrite passes over a [`Computation`] in a fixed order, each gated by
//! a configuration flag. Every pass either fully applies a rewrite or leaves
//! the computation unchanged; disabling any flag affects performance of the
//! compiled computation, never its result.
//!
//! Pass order: variable merging → model-update consolidation → zero-init
//! elimination → sizing-command motion → allocation reuse. Each pass entry
//! point validates the computation and computes a fresh analysis, so no
//! stale analysis ever crosses a structural edit.

pub mod consolidate;
pub mod merge;
pub mod reuse;
pub mod sizing;
pub mod zeroing;


use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ir::{check, Computation};

pub use consolidate::consolidate_model_update;
pub use merge::variable_merging;
pub use reuse::remove_unnecessary_allocation;
pub use sizing::move_sizing_commands;
pub use zeroing::remove_unnecessary_zeroing;

/// Per-pass switches. Everything defaults to on; the main use for turning a
/// flag off is isolating which pass is responsible when a miscompilation is
/// suspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    /// Master switch: false disables every pass below.
    pub optimize: bool,
    /// Consolidate the model-update phase of backprop (recurrent setups).
    pub consolidate_model_update: bool,
    /// Allow in-place execution of forward ops.
    pub propagate_in_place: bool,
    /// Allow in-place execution of backward ops.
    pub backprop_in_place: bool,
    /// Remove redundant copy commands while merging.
    pub remove_assignments: bool,
    /// Allow merges that extend a variable's lifetime backward.
    pub allow_left_merge: bool,
    /// Allow merges that extend a variable's lifetime forward.
    pub allow_right_merge: bool,
    /// Downgrade zero-initializing allocations that are provably redundant.
    pub initialize_undefined: bool,
    /// Move allocations as late, and deallocations as early, as possible.
    pub move_sizing_commands: bool,
    /// Reuse a freed backing store for a same-shape allocation.
    pub allocate_from_other: bool,
}

impl Default for OptimizeConfig {
    fn default() -> OptimizeConfig {
        OptimizeConfig {
            optimize: true,
            consolidate_model_update: true,
            propagate_in_place: true,
            backprop_in_place: true,
            remove_assignments: true,
            allow_left_merge: true,
            allow_right_merge: true,
            initialize_undefined: true,
            move_sizing_commands: true,
            allocate_from_other: true,
        }
    }
}

/// Run the full pipeline over `computation` in place.
///
/// The computation is validated before the first pass and after the last;
/// malformed IR aborts compilation rather than producing a wrong result.
pub fn optimize(config: &OptimizeConfig, computation: &mut Computation) -> Result<(), Error> {
    check::check(computation)?;
    if !config.optimize {
        return Ok(());
    }

    if config.propagate_in_place || config.backprop_in_place || config.remove_assignments {
        variable_merging(config, computation)?;
    }
    if config.consolidate_model_update {
        consolidate_model_update(computation)?;
    }
    if config.initialize_undefined {
        remove_unnecessary_zeroing(computation)?;
    }
    if config.move_sizing_commands {
        move_sizing_commands(computation)?;
    }
    if config.allocate_from_other {
        remove_unnecessary_allocation(computation)?;
    }

    check::check(computation)?;
    Ok(())
}

//! Variable merging: in-place execution and redundant-copy removal.
//!
//! Finds commands of the shape `dst <- f(src)` where `dst` and `src` are
//! whole-matrix views of distinct, same-shape matrices whose live intervals
//! touch only at that command: the source's last data access and the
//! destination's first data access are both the command itself. Merging
//! rewrites every use of one matrix onto the other, so the command executes
//! in place; if the command was a plain copy it becomes dead and is removed.
//!
//! A merge direction names which lifetime gets extended. A left merge keeps
//! the destination's matrix and extends its lifetime backward over the
//! source's; a right merge keeps the source's matrix and extends it forward.
//! Either way the survivor takes the earlier allocation, the later
//! deallocation, and the source's allocation kind (the destination's own
//! initialization is irrelevant: its first data access is a full overwrite).
//!
//! A candidate that fails any condition is skipped, never partially applied.

use crate::analysis::Analysis;
use crate::error::Error;
use crate::ir::{check, AllocKind, Command, Computation, MatrixId, SubmatrixId};
use crate::optimize::OptimizeConfig;

/// Merge variables until no candidate remains. Returns whether the
/// computation changed.
pub fn variable_merging(
    config: &OptimizeConfig,
    computation: &mut Computation,
) -> Result<bool, Error> {
    check::check(computation)?;
    let mut changed = false;
    // Every applied merge invalidates the analysis, so rescan from scratch
    // after each one. An applied candidate can never match again (a copy
    // becomes a tombstone, an in-place op has one matrix on both sides), so
    // this terminates.
    loop {
        let analysis = Analysis::compute(computation);
        let mut applied = false;
        for c in 0..computation.commands.len() {
            let Some((dst, src)) = merge_candidate(config, &computation.commands[c]) else {
                continue;
            };
            if let Some(plan) = plan_merge(config, computation, &analysis, c, dst, src) {
                apply_merge(computation, c, &plan);
                applied = true;
                changed = true;
                break;
            }
        }
        if !applied {
            break;
        }
    }
    if changed {
        computation.renumber();
    }
    Ok(changed)
}

/// The (destination, source) submatrices of a mergeable command, honoring the
/// per-class in-place gates.
fn merge_candidate(config: &OptimizeConfig, cmd: &Command) -> Option<(SubmatrixId, SubmatrixId)> {
    match *cmd {
        Command::Copy { dst, src } if config.remove_assignments => Some((dst, src)),
        Command::Propagate { input, output, .. } if config.propagate_in_place => {
            Some((output, input))
        }
        Command::Backprop {
            out_deriv,
            in_deriv,
            ..
        } if config.backprop_in_place => Some((in_deriv, out_deriv)),
        _ => None,
    }
}

struct MergePlan {
    keep: MatrixId,
    discard: MatrixId,
    /// Sizing commands of the two matrices, from the pre-merge analysis.
    alloc_keep: usize,
    dealloc_keep: usize,
    alloc_discard: usize,
    dealloc_discard: usize,
    /// The survivor's allocation kind (the source matrix's).
    zeroed: bool,
    /// Plain copies become tombstones once merged.
    remove_command: bool,
}

/// Validate a candidate completely; `None` means skip it.
fn plan_merge(
    config: &OptimizeConfig,
    computation: &Computation,
    analysis: &Analysis,
    c: usize,
    dst: SubmatrixId,
    src: SubmatrixId,
) -> Option<MergePlan> {
    let m1 = computation.submatrix(dst).matrix;
    let m2 = computation.submatrix(src).matrix;
    if m1 == m2 {
        return None;
    }
    if !computation.is_whole_matrix(dst) || !computation.is_whole_matrix(src) {
        return None;
    }
    let (mat1, mat2) = (computation.matrix(m1), computation.matrix(m2));
    if (mat1.rows, mat1.cols) != (mat2.rows, mat2.cols) {
        return None;
    }
    // Reused or pending allocations carry storage relationships a merge
    // would break.
    let zeroed = match (mat1.kind, mat2.kind) {
        (AllocKind::Zeroed | AllocKind::Undefined, AllocKind::Zeroed) => true,
        (AllocKind::Zeroed | AllocKind::Undefined, AllocKind::Undefined) => false,
        _ => return None,
    };

    // Live intervals may overlap only at c: the source dies here and the
    // destination is born here.
    if analysis.matrix_accessed_after(m2, c) {
        return None;
    }
    if analysis.matrix_accessed_before(m1, c) {
        return None;
    }

    let (alloc1, dealloc1) = analysis.live_interval(m1)?;
    let (alloc2, dealloc2) = analysis.live_interval(m2)?;

    // Both lifetimes must end in plain deallocations; a lifetime ending in an
    // allocate-from-other hands its storage to a third matrix, and rewriting
    // that command would break the hand-off.
    if !matches!(computation.commands[dealloc1], Command::Dealloc(_))
        || !matches!(computation.commands[dealloc2], Command::Dealloc(_))
    {
        return None;
    }

    let (keep, discard, alloc_keep, dealloc_keep, alloc_discard, dealloc_discard) =
        if config.allow_left_merge {
            (m1, m2, alloc1, dealloc1, alloc2, dealloc2)
        } else if config.allow_right_merge {
            (m2, m1, alloc2, dealloc2, alloc1, dealloc1)
        } else {
            return None;
        };

    Some(MergePlan {
        keep,
        discard,
        alloc_keep,
        dealloc_keep,
        alloc_discard,
        dealloc_discard,
        zeroed,
        remove_command: matches!(computation.commands[c], Command::Copy { .. }),
    })
}

fn apply_merge(computation: &mut Computation, c: usize, plan: &MergePlan) {
    // Redirect every view of the discarded matrix. Shapes match, so offsets
    // carry over unchanged.
    for i in 0..computation.num_submatrices() {
        let sub = computation.submatrix_mut(SubmatrixId(i));
        if sub.matrix == plan.discard {
            sub.matrix = plan.keep;
        }
    }

    // The survivor spans the union lifetime: earliest allocation, latest
    // deallocation. The redundant pair becomes tombstones.
    let alloc = plan.alloc_keep.min(plan.alloc_discard);
    let stale_alloc = plan.alloc_keep.max(plan.alloc_discard);
    let dealloc = plan.dealloc_keep.max(plan.dealloc_discard);
    let stale_dealloc = plan.dealloc_keep.min(plan.dealloc_discard);

    computation.commands[alloc] = if plan.zeroed {
        Command::AllocZeroed(plan.keep)
    } else {
        Command::AllocUndefined(plan.keep)
    };
    computation.commands[stale_alloc] = Command::NoOp;
    computation.commands[dealloc] = Command::Dealloc(plan.keep);
    computation.commands[stale_dealloc] = Command::NoOp;
    computation.matrix_mut(plan.keep).kind = if plan.zeroed {
        AllocKind::Zeroed
    } else {
        AllocKind::Undefined
    };

    if plan.remove_command {
        computation.commands[c] = Command::NoOp;
    }
}

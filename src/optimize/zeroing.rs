//! Zero-init elimination.
//!
//! A zero-filled allocation is redundant when every element of the matrix is
//! written before it is read; the fill can then be skipped at execution time
//! by downgrading the allocation to an uninitialized one. The proof is per
//! variable and must cover the matrix's full extent: every variable needs at
//! least one data access, and the first must be a pure write. Partial-row
//! writes were already classified read-write by the analyzer, so they can
//! never serve as the covering first write.

use crate::analysis::Analysis;
use crate::error::Error;
use crate::ir::{check, AllocKind, Command, Computation, MatrixId};

/// Downgrade provably redundant zero-filled allocations. Returns whether the
/// computation changed.
pub fn remove_unnecessary_zeroing(computation: &mut Computation) -> Result<bool, Error> {
    check::check(computation)?;
    let analysis = Analysis::compute(computation);

    let mut downgrade: Vec<MatrixId> = Vec::new();
    for m in 0..computation.num_matrices() {
        let id = MatrixId(m);
        let zeroed = matches!(
            computation.matrix(id).kind,
            AllocKind::Zeroed | AllocKind::FromOther { zeroed: true }
        );
        if !zeroed {
            continue;
        }
        let fully_written_first = analysis.variables.variables_for_matrix(id).all(|v| {
            match analysis.variable_accesses[v].first() {
                Some(first) => first.is_write() && !first.is_read(),
                None => false,
            }
        });
        if fully_written_first {
            downgrade.push(id);
        }
    }

    for &id in &downgrade {
        let alloc = analysis.matrix_accesses[id.0].allocate_command;
        let Some(alloc) = alloc else { continue };
        match &mut computation.commands[alloc] {
            cmd @ Command::AllocZeroed(_) => {
                *cmd = Command::AllocUndefined(id);
                computation.matrix_mut(id).kind = AllocKind::Undefined;
            }
            Command::AllocFromOther { zeroed, .. } => {
                *zeroed = false;
                computation.matrix_mut(id).kind = AllocKind::FromOther { zeroed: false };
            }
            _ => {}
        }
    }
    Ok(!downgrade.is_empty())
}

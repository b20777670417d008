//! Allocation reuse.
//!
//! After sizing motion, a deallocation of a matrix of some shape is often
//! followed, a few commands later, by an allocation of another matrix of the
//! same shape. Each such pair becomes one allocate-from-other command that
//! hands the freed backing store to the new matrix, cutting the number of
//! allocation-system calls the executor makes. The zero-fill state of the
//! replaced allocation carries over on its `zeroed` flag.
//!
//! Matching is exact on (rows, cols); each deallocation is consumed by at
//! most one later allocation, first come first served.

use std::collections::{BTreeMap, VecDeque};

use crate::error::Error;
use crate::ir::{check, AllocKind, Command, Computation, MatrixId};

/// Pair deallocations with later same-shape allocations. Returns whether the
/// computation changed.
pub fn remove_unnecessary_allocation(computation: &mut Computation) -> Result<bool, Error> {
    check::check(computation)?;

    // Per shape: deallocations whose storage is still unclaimed.
    let mut pending: BTreeMap<(usize, usize), VecDeque<(usize, MatrixId)>> = BTreeMap::new();
    let mut changed = false;

    for c in 0..computation.commands.len() {
        match computation.commands[c] {
            Command::Dealloc(m) => {
                let mat = computation.matrix(m);
                pending
                    .entry((mat.rows, mat.cols))
                    .or_default()
                    .push_back((c, m));
            }
            Command::AllocZeroed(m) | Command::AllocUndefined(m) => {
                let mat = computation.matrix(m);
                let zeroed = mat.kind == AllocKind::Zeroed;
                let shape = (mat.rows, mat.cols);
                let Some((dealloc, src)) = pending.get_mut(&shape).and_then(|q| q.pop_front())
                else {
                    continue;
                };
                computation.commands[dealloc] = Command::NoOp;
                computation.commands[c] = Command::AllocFromOther {
                    dst: m,
                    src,
                    zeroed,
                };
                computation.matrix_mut(m).kind = AllocKind::FromOther { zeroed };
                changed = true;
            }
            _ => {}
        }
    }
    Ok(changed)
}

//! Structural validity checker for computations.
//!
//! Malformed IR must abort compilation rather than silently produce a wrong
//! result, so the driver runs this before the first pass and after the last,
//! and every pass entry point runs it before trusting the arenas.

use crate::error::Error;
use crate::ir::{AllocKind, Command, Computation, MatrixId};

/// Check every structural invariant of `computation`:
///
/// - every submatrix references an existing matrix and stays in bounds;
/// - every command operand references an existing submatrix or matrix;
/// - every matrix has exactly one allocating command and exactly one
///   deallocating command, in that order, with every data access strictly
///   between them;
/// - every matrix's declared allocation kind agrees with its allocating
///   command.
pub fn check(computation: &Computation) -> Result<(), Error> {
    check_references(computation)?;
    check_sizing(computation)?;
    Ok(())
}

fn check_references(computation: &Computation) -> Result<(), Error> {
    for (i, sub) in computation.submatrices().iter().enumerate() {
        let Some(m) = computation.matrices().get(sub.matrix.0) else {
            return Err(Error::check(format!(
                "submatrix s{i} references nonexistent matrix {}",
                sub.matrix
            )));
        };
        if sub.rows == 0 || sub.cols == 0 {
            return Err(Error::check(format!("submatrix s{i} is empty")));
        }
        if sub.row_offset + sub.rows > m.rows || sub.col_offset + sub.cols > m.cols {
            return Err(Error::check(format!(
                "submatrix s{i} exceeds the bounds of {} ({}x{})",
                sub.matrix, m.rows, m.cols
            )));
        }
    }

    for (c, cmd) in computation.commands.iter().enumerate() {
        for s in cmd.submatrix_operands() {
            if s.0 >= computation.num_submatrices() {
                return Err(Error::check(format!(
                    "command c{c} references nonexistent submatrix {s}"
                )));
            }
        }
        for m in [cmd.allocated_matrix(), cmd.deallocated_matrix()]
            .into_iter()
            .flatten()
        {
            if m.0 >= computation.num_matrices() {
                return Err(Error::check(format!(
                    "command c{c} references nonexistent matrix {m}"
                )));
            }
        }
    }
    Ok(())
}

fn check_sizing(computation: &Computation) -> Result<(), Error> {
    let num_matrices = computation.num_matrices();
    let mut alloc: Vec<Option<usize>> = vec![None; num_matrices];
    let mut dealloc: Vec<Option<usize>> = vec![None; num_matrices];

    for (c, cmd) in computation.commands.iter().enumerate() {
        if let Some(m) = cmd.allocated_matrix() {
            if alloc[m.0].is_some() {
                return Err(Error::check(format!("matrix {m} is allocated twice")));
            }
            alloc[m.0] = Some(c);
            check_kind(computation, m, cmd)?;
        }
        if let Some(m) = cmd.deallocated_matrix() {
            if dealloc[m.0].is_some() {
                return Err(Error::check(format!("matrix {m} is deallocated twice")));
            }
            dealloc[m.0] = Some(c);
        }
    }

    for m in 0..num_matrices {
        let id = MatrixId(m);
        let (a, d) = match (alloc[m], dealloc[m]) {
            (Some(a), Some(d)) => (a, d),
            (None, _) => {
                return Err(Error::check(format!("matrix {id} is never allocated")));
            }
            (_, None) => {
                return Err(Error::check(format!("matrix {id} is never deallocated")));
            }
        };
        if a >= d {
            return Err(Error::check(format!(
                "matrix {id} is deallocated (c{d}) before it is allocated (c{a})"
            )));
        }
    }

    // Every data access must fall strictly inside the live window.
    for (c, cmd) in computation.commands.iter().enumerate() {
        for s in cmd.submatrix_operands() {
            let m = computation.submatrix(s).matrix;
            let (a, d) = (alloc[m.0], dealloc[m.0]);
            let inside = matches!((a, d), (Some(a), Some(d)) if a < c && c < d);
            if !inside {
                return Err(Error::check(format!(
                    "command c{c} accesses {m} outside its live window"
                )));
            }
        }
    }
    Ok(())
}

fn check_kind(computation: &Computation, m: MatrixId, cmd: &Command) -> Result<(), Error> {
    let kind = computation.matrix(m).kind;
    let consistent = match cmd {
        Command::AllocZeroed(_) => kind == AllocKind::Zeroed,
        Command::AllocUndefined(_) => kind == AllocKind::Undefined,
        Command::AllocFromOther { zeroed, .. } => kind == AllocKind::FromOther { zeroed: *zeroed },
        _ => true,
    };
    if !consistent {
        return Err(Error::check(format!(
            "matrix {m} has allocation kind {kind:?} but is allocated by `{cmd}`"
        )));
    }
    // AllocFromOther additionally requires matching shapes.
    if let Command::AllocFromOther { dst, src, .. } = cmd {
        let (d, s) = (computation.matrix(*dst), computation.matrix(*src));
        if (d.rows, d.cols) != (s.rows, s.cols) {
            return Err(Error::check(format!(
                "alloc_from_other shape mismatch: {dst} is {}x{}, {src} is {}x{}",
                d.rows, d.cols, s.rows, s.cols
            )));
        }
    }
    Ok(())
}

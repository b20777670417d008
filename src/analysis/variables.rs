//! Splitting matrices into analysis variables, and classifying each
//! command's reads and writes of them.
//!
//! A variable is one (matrix, column-range) cell spanning all rows of the
//! matrix, where the column ranges are cut at the union of the column
//! boundaries of every submatrix referencing the matrix. Cutting at the
//! boundaries means a submatrix either covers a cell's columns completely or
//! not at all, so access classification never has to split a cell.

use std::collections::BTreeSet;
use std::ops::Range;

use crate::ir::{Command, Computation, MatrixId, SubmatrixId};

pub type VariableId = usize;

/// The matrix → variable split for one computation, plus the per-submatrix
/// lookup tables the analyzer needs.
#[derive(Debug)]
pub struct ComputationVariables {
    /// Per matrix: sorted column boundaries, starting at 0 and ending at the
    /// matrix's column count. A matrix with boundaries `[0, 3, 5]` has two
    /// variables: columns `0..3` and `3..5`.
    split_points: Vec<Vec<usize>>,
    /// First variable id of each matrix (prefix sums over cell counts).
    matrix_base: Vec<usize>,
    num_variables: usize,
    /// Per submatrix: the variables its column range covers.
    submatrix_variables: Vec<Vec<VariableId>>,
    /// Per submatrix: whether it spans every row of its matrix. A write
    /// through a partial-row view leaves the other rows of the variable
    /// intact, so it is classified as a read-write.
    submatrix_full_rows: Vec<bool>,
}

impl ComputationVariables {
    pub fn compute(computation: &Computation) -> ComputationVariables {
        let num_matrices = computation.num_matrices();
        let mut boundaries: Vec<BTreeSet<usize>> = (0..num_matrices)
            .map(|m| {
                let cols = computation.matrices()[m].cols;
                BTreeSet::from([0, cols])
            })
            .collect();
        for sub in computation.submatrices() {
            let set = &mut boundaries[sub.matrix.0];
            set.insert(sub.col_offset);
            set.insert(sub.col_offset + sub.cols);
        }
        let split_points: Vec<Vec<usize>> =
            boundaries.into_iter().map(|set| set.into_iter().collect()).collect();

        let mut matrix_base = Vec::with_capacity(num_matrices);
        let mut num_variables = 0;
        for points in &split_points {
            matrix_base.push(num_variables);
            num_variables += points.len() - 1;
        }

        let mut submatrix_variables = Vec::with_capacity(computation.num_submatrices());
        let mut submatrix_full_rows = Vec::with_capacity(computation.num_submatrices());
        for sub in computation.submatrices() {
            let points = &split_points[sub.matrix.0];
            let base = matrix_base[sub.matrix.0];
            // Both ends are boundaries by construction.
            let lo = points.partition_point(|&p| p < sub.col_offset);
            let hi = points.partition_point(|&p| p < sub.col_offset + sub.cols);
            submatrix_variables.push((base + lo..base + hi).collect());
            let matrix_rows = computation.matrix(sub.matrix).rows;
            submatrix_full_rows.push(sub.row_offset == 0 && sub.rows == matrix_rows);
        }

        ComputationVariables {
            split_points,
            matrix_base,
            num_variables,
            submatrix_variables,
            submatrix_full_rows,
        }
    }

    pub fn num_variables(&self) -> usize {
        self.num_variables
    }

    pub fn variables_for_submatrix(&self, s: SubmatrixId) -> &[VariableId] {
        &self.submatrix_variables[s.0]
    }

    /// Whether accesses through `s` cover the full row extent of each of its
    /// variables.
    pub fn full_row_access(&self, s: SubmatrixId) -> bool {
        self.submatrix_full_rows[s.0]
    }

    pub fn variables_for_matrix(&self, m: MatrixId) -> Range<VariableId> {
        let base = self.matrix_base[m.0];
        base..base + self.split_points[m.0].len() - 1
    }

    /// The matrix a variable belongs to.
    pub fn matrix_of_variable(&self, v: VariableId) -> MatrixId {
        let m = self.matrix_base.partition_point(|&b| b <= v) - 1;
        MatrixId(m)
    }
}

/// The variables and matrices one command reads and writes.
///
/// Conservative by construction: an access whose target cannot be proven to
/// overwrite a variable completely counts as both a read and a write of it.
#[derive(Debug, Default)]
pub struct CommandAttributes {
    pub variables_read: Vec<VariableId>,
    pub variables_written: Vec<VariableId>,
    pub matrices_read: Vec<MatrixId>,
    pub matrices_written: Vec<MatrixId>,
    /// Model updates mutate state outside the computation; they may never be
    /// deleted or reordered past another update of the same parameter.
    pub has_side_effects: bool,
}

impl CommandAttributes {
    fn read(&mut self, computation: &Computation, vars: &ComputationVariables, s: SubmatrixId) {
        self.variables_read.extend(vars.variables_for_submatrix(s));
        self.matrices_read.push(computation.submatrix(s).matrix);
    }

    /// Record a full overwrite of `s`. Downgraded to a read-write when the
    /// view does not span all rows of its matrix.
    fn write(&mut self, computation: &Computation, vars: &ComputationVariables, s: SubmatrixId) {
        self.variables_written.extend(vars.variables_for_submatrix(s));
        self.matrices_written.push(computation.submatrix(s).matrix);
        if !vars.full_row_access(s) {
            self.variables_read.extend(vars.variables_for_submatrix(s));
            self.matrices_read.push(computation.submatrix(s).matrix);
        }
    }

    fn read_write(
        &mut self,
        computation: &Computation,
        vars: &ComputationVariables,
        s: SubmatrixId,
    ) {
        self.read(computation, vars, s);
        self.variables_written.extend(vars.variables_for_submatrix(s));
        self.matrices_written.push(computation.submatrix(s).matrix);
    }

    fn finish(mut self) -> CommandAttributes {
        self.variables_read.sort_unstable();
        self.variables_read.dedup();
        self.variables_written.sort_unstable();
        self.variables_written.dedup();
        self.matrices_read.sort_unstable();
        self.matrices_read.dedup();
        self.matrices_written.sort_unstable();
        self.matrices_written.dedup();
        self
    }
}

/// Classify the data accesses of every command.
///
/// Sizing commands record no data accesses here; their effect on liveness is
/// tracked separately through the matrix live window. Zero-filling counts as
/// initialization, not as a data write, so the zero-init elimination pass can
/// ask "is the first *data* access of this variable a write".
pub fn compute_command_attributes(
    computation: &Computation,
    vars: &ComputationVariables,
) -> Vec<CommandAttributes> {
    computation
        .commands
        .iter()
        .map(|cmd| {
            let mut a = CommandAttributes::default();
            match *cmd {
                Command::Propagate { input, output, .. } => {
                    a.read(computation, vars, input);
                    a.write(computation, vars, output);
                }
                Command::Backprop {
                    out_deriv,
                    in_deriv,
                    ..
                } => {
                    a.read(computation, vars, out_deriv);
                    a.write(computation, vars, in_deriv);
                }
                Command::ModelUpdate {
                    input, out_deriv, ..
                } => {
                    a.read(computation, vars, input);
                    a.read(computation, vars, out_deriv);
                    a.has_side_effects = true;
                }
                Command::Copy { dst, src } => {
                    a.read(computation, vars, src);
                    a.write(computation, vars, dst);
                }
                Command::Add { dst, src } | Command::AddRows { dst, src } => {
                    a.read(computation, vars, src);
                    a.read_write(computation, vars, dst);
                }
                // The executor owns the row-index table, so coverage of the
                // destination is unknowable here.
                Command::CopyRows { dst, src } => {
                    a.read(computation, vars, src);
                    a.read_write(computation, vars, dst);
                }
                Command::Scale { dst, factor } => {
                    if factor == 0.0 {
                        a.write(computation, vars, dst);
                    } else {
                        a.read_write(computation, vars, dst);
                    }
                }
                Command::AllocZeroed(_)
                | Command::AllocUndefined(_)
                | Command::AllocFromOther { .. }
                | Command::Dealloc(_)
                | Command::NoOp => {}
            }
            a.finish()
        })
        .collect()
}

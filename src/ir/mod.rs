//! Intermediate representation of one concrete forward/backward computation.
//!
//! The IR is a flat, ordered list of commands over matrices; command order is
//! the sole control-flow structure. Matrices and submatrices live in arenas
//! owned by the [`Computation`] and are addressed by stable integer ids, so
//! passes rewrite references by index substitution instead of pointer
//! aliasing.
//!
//! Semantics the optimizer relies on: `Propagate` and `Backprop` *overwrite*
//! their output operand (accumulation is expressed with explicit `Add`
//! commands), and `ModelUpdate` is a side-effecting command that may never be
//! deleted or reordered past another update of the same parameter.

pub mod check;

#[cfg(test)]
mod tests;

use std::fmt;

use crate::error::Error;

// ─── Ids ────────────────────────────────────────────────────────────

/// Index of a matrix in the computation's matrix arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MatrixId(pub usize);

/// Index of a submatrix in the computation's submatrix arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmatrixId(pub usize);

/// Opaque identifier of a forward/backward kernel, owned by the math backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u32);

/// Opaque identifier of a trainable parameter, owned by the math backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamId(pub u32);

impl fmt::Display for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl fmt::Display for SubmatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

// ─── Matrices and submatrices ───────────────────────────────────────

/// How a matrix's backing store is obtained at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Freshly allocated and zero-filled.
    Zeroed,
    /// Freshly allocated, contents undefined.
    Undefined,
    /// Takes over the backing store of a deallocated matrix of the same
    /// shape; zero-filled afterwards iff `zeroed`.
    FromOther { zeroed: bool },
    /// Created mid-pipeline; no allocation command has been inserted yet.
    /// Never present in a computation handed to the driver or the executor.
    Pending,
}

/// An allocation unit: a fixed-shape block of memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub kind: AllocKind,
}

/// A rectangular view into exactly one matrix. Submatrices never own memory;
/// several may alias the same matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Submatrix {
    pub matrix: MatrixId,
    pub row_offset: usize,
    pub rows: usize,
    pub col_offset: usize,
    pub cols: usize,
}

// ─── Commands ───────────────────────────────────────────────────────

/// A single IR instruction.
///
/// `NoOp` is the tombstone passes leave behind when they delete a command
/// without renumbering the sequence; [`Computation::freeze`] strips
/// tombstones before the computation is handed to the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // ── Sizing ──
    AllocZeroed(MatrixId),
    AllocUndefined(MatrixId),
    /// Reassign the backing store of `src` (deallocating it) to `dst`.
    AllocFromOther {
        dst: MatrixId,
        src: MatrixId,
        zeroed: bool,
    },
    Dealloc(MatrixId),

    // ── Forward / backward kernels ──
    Propagate {
        op: OpId,
        input: SubmatrixId,
        output: SubmatrixId,
    },
    Backprop {
        op: OpId,
        out_deriv: SubmatrixId,
        in_deriv: SubmatrixId,
    },
    /// Accumulate a parameter update from one (input, output-derivative)
    /// pair. Side-effecting: never removed, never reordered past another
    /// update of the same parameter.
    ModelUpdate {
        param: ParamId,
        input: SubmatrixId,
        out_deriv: SubmatrixId,
    },

    // ── Data movement ──
    Copy { dst: SubmatrixId, src: SubmatrixId },
    Add { dst: SubmatrixId, src: SubmatrixId },
    Scale { dst: SubmatrixId, factor: f32 },
    AddRows { dst: SubmatrixId, src: SubmatrixId },
    CopyRows { dst: SubmatrixId, src: SubmatrixId },

    /// Tombstone.
    NoOp,
}

impl Command {
    /// The matrix this command allocates, if it is an allocating command.
    pub fn allocated_matrix(&self) -> Option<MatrixId> {
        match *self {
            Command::AllocZeroed(m) | Command::AllocUndefined(m) => Some(m),
            Command::AllocFromOther { dst, .. } => Some(dst),
            _ => None,
        }
    }

    /// The matrix this command deallocates. `AllocFromOther` counts: it ends
    /// the source matrix's lifetime by handing its storage to `dst`.
    pub fn deallocated_matrix(&self) -> Option<MatrixId> {
        match *self {
            Command::Dealloc(m) => Some(m),
            Command::AllocFromOther { src, .. } => Some(src),
            _ => None,
        }
    }

    /// Submatrix operands in a fixed order (reads before writes where the
    /// distinction exists).
    pub fn submatrix_operands(&self) -> Vec<SubmatrixId> {
        match *self {
            Command::Propagate { input, output, .. } => vec![input, output],
            Command::Backprop {
                out_deriv,
                in_deriv,
                ..
            } => vec![out_deriv, in_deriv],
            Command::ModelUpdate {
                input, out_deriv, ..
            } => vec![input, out_deriv],
            Command::Copy { dst, src }
            | Command::Add { dst, src }
            | Command::AddRows { dst, src }
            | Command::CopyRows { dst, src } => vec![src, dst],
            Command::Scale { dst, .. } => vec![dst],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Command::AllocZeroed(m) => write!(f, "alloc_zeroed {m}"),
            Command::AllocUndefined(m) => write!(f, "alloc_undefined {m}"),
            Command::AllocFromOther { dst, src, zeroed } => {
                let tag = if zeroed { "zeroed" } else { "unzeroed" };
                write!(f, "alloc_from_other {dst} <- {src} ({tag})")
            }
            Command::Dealloc(m) => write!(f, "dealloc {m}"),
            Command::Propagate { op, input, output } => {
                write!(f, "propagate {op} {output} <- {input}")
            }
            Command::Backprop {
                op,
                out_deriv,
                in_deriv,
            } => write!(f, "backprop {op} {in_deriv} <- {out_deriv}"),
            Command::ModelUpdate {
                param,
                input,
                out_deriv,
            } => write!(f, "model_update {param} input={input} deriv={out_deriv}"),
            Command::Copy { dst, src } => write!(f, "copy {dst} <- {src}"),
            Command::Add { dst, src } => write!(f, "add {dst} += {src}"),
            Command::Scale { dst, factor } => write!(f, "scale {dst} *= {factor}"),
            Command::AddRows { dst, src } => write!(f, "add_rows {dst} += {src}"),
            Command::CopyRows { dst, src } => write!(f, "copy_rows {dst} <- {src}"),
            Command::NoOp => write!(f, "no_op"),
        }
    }
}

// ─── Computation ────────────────────────────────────────────────────

/// One-shot state of the model-update consolidation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidationState {
    Unconsolidated,
    Consolidated,
}

/// A submatrix operand resolved to its concrete location, precomputed by
/// [`Computation::freeze`] so the executor never chases submatrix ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOperand {
    pub matrix: MatrixId,
    pub row_offset: usize,
    pub rows: usize,
    pub col_offset: usize,
    pub cols: usize,
}

/// The single mutable artifact of compilation: the ordered command sequence
/// plus the matrix and submatrix arenas it refers to.
///
/// Built once per distinct request, mutated destructively by the pass
/// pipeline, then frozen for repeated execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Computation {
    pub commands: Vec<Command>,
    matrices: Vec<Matrix>,
    submatrices: Vec<Submatrix>,
    consolidation: ConsolidationState,
    frozen: bool,
    /// Per-command resolved operands, filled in by `freeze`.
    resolved: Vec<Vec<ResolvedOperand>>,
}

impl Default for Computation {
    fn default() -> Self {
        Computation::new()
    }
}

impl Computation {
    pub fn new() -> Computation {
        Computation {
            commands: Vec::new(),
            matrices: Vec::new(),
            submatrices: Vec::new(),
            consolidation: ConsolidationState::Unconsolidated,
            frozen: false,
            resolved: Vec::new(),
        }
    }

    // ── Arena construction ──

    pub fn new_matrix(&mut self, rows: usize, cols: usize, kind: AllocKind) -> MatrixId {
        self.matrices.push(Matrix { rows, cols, kind });
        MatrixId(self.matrices.len() - 1)
    }

    pub fn new_submatrix(
        &mut self,
        matrix: MatrixId,
        row_offset: usize,
        rows: usize,
        col_offset: usize,
        cols: usize,
    ) -> SubmatrixId {
        self.submatrices.push(Submatrix {
            matrix,
            row_offset,
            rows,
            col_offset,
            cols,
        });
        SubmatrixId(self.submatrices.len() - 1)
    }

    /// A submatrix spanning the whole of `matrix`.
    pub fn whole_submatrix(&mut self, matrix: MatrixId) -> SubmatrixId {
        let (rows, cols) = {
            let m = &self.matrices[matrix.0];
            (m.rows, m.cols)
        };
        self.new_submatrix(matrix, 0, rows, 0, cols)
    }

    // ── Accessors ──

    pub fn num_matrices(&self) -> usize {
        self.matrices.len()
    }

    pub fn num_submatrices(&self) -> usize {
        self.submatrices.len()
    }

    pub fn matrix(&self, id: MatrixId) -> &Matrix {
        &self.matrices[id.0]
    }

    pub fn matrix_mut(&mut self, id: MatrixId) -> &mut Matrix {
        &mut self.matrices[id.0]
    }

    pub fn submatrix(&self, id: SubmatrixId) -> &Submatrix {
        &self.submatrices[id.0]
    }

    pub fn submatrix_mut(&mut self, id: SubmatrixId) -> &mut Submatrix {
        &mut self.submatrices[id.0]
    }

    pub fn matrices(&self) -> &[Matrix] {
        &self.matrices
    }

    pub fn submatrices(&self) -> &[Submatrix] {
        &self.submatrices
    }

    /// Whether `id` views the entirety of its matrix.
    pub fn is_whole_matrix(&self, id: SubmatrixId) -> bool {
        let s = &self.submatrices[id.0];
        let m = &self.matrices[s.matrix.0];
        s.row_offset == 0 && s.col_offset == 0 && s.rows == m.rows && s.cols == m.cols
    }

    pub fn consolidation_state(&self) -> ConsolidationState {
        self.consolidation
    }

    pub(crate) fn set_consolidation_state(&mut self, state: ConsolidationState) {
        self.consolidation = state;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Resolved operands of command `index`, in the order of
    /// [`Command::submatrix_operands`]. Empty until the computation is frozen.
    pub fn resolved_operands(&self, index: usize) -> &[ResolvedOperand] {
        match self.resolved.get(index) {
            Some(ops) => ops,
            None => &[],
        }
    }

    // ── Structural maintenance ──

    /// Drop tombstones left behind by passes.
    pub fn strip_noops(&mut self) {
        self.commands.retain(|c| *c != Command::NoOp);
    }

    /// Compact the arenas: deduplicate identical submatrices, drop matrices
    /// nothing references, and rewrite all ids in commands and submatrices.
    ///
    /// Passes that retire matrices (variable merging) call this so the
    /// matrix/submatrix count reflects the rewritten computation.
    pub fn renumber(&mut self) {
        use std::collections::HashMap;

        // Deduplicate submatrices: map every operand to the first
        // structurally identical submatrix any command uses.
        let mut first_of: HashMap<Submatrix, SubmatrixId> = HashMap::new();
        let mut used_subs: Vec<bool> = vec![false; self.submatrices.len()];
        let mut sub_rep: Vec<SubmatrixId> = (0..self.submatrices.len()).map(SubmatrixId).collect();
        for cmd in &self.commands {
            for s in cmd.submatrix_operands() {
                let key = self.submatrices[s.0];
                let rep = *first_of.entry(key).or_insert(s);
                sub_rep[s.0] = rep;
                used_subs[rep.0] = true;
            }
        }

        // Compact the submatrix arena.
        let mut sub_new_id: Vec<Option<SubmatrixId>> = vec![None; self.submatrices.len()];
        let mut new_subs: Vec<Submatrix> = Vec::new();
        for (i, sub) in self.submatrices.iter().enumerate() {
            if used_subs[i] {
                sub_new_id[i] = Some(SubmatrixId(new_subs.len()));
                new_subs.push(*sub);
            }
        }

        // A matrix is live if a surviving submatrix or a sizing command
        // refers to it.
        let mut used_mats: Vec<bool> = vec![false; self.matrices.len()];
        for sub in &new_subs {
            used_mats[sub.matrix.0] = true;
        }
        for cmd in &self.commands {
            if let Some(m) = cmd.allocated_matrix() {
                used_mats[m.0] = true;
            }
            if let Some(m) = cmd.deallocated_matrix() {
                used_mats[m.0] = true;
            }
        }

        let mut mat_new_id: Vec<Option<MatrixId>> = vec![None; self.matrices.len()];
        let mut new_mats: Vec<Matrix> = Vec::new();
        for (i, mat) in self.matrices.iter().enumerate() {
            if used_mats[i] {
                mat_new_id[i] = Some(MatrixId(new_mats.len()));
                new_mats.push(mat.clone());
            }
        }

        let remap_sub = |s: SubmatrixId| -> SubmatrixId {
            match sub_new_id[sub_rep[s.0].0] {
                Some(id) => id,
                None => s,
            }
        };
        let remap_mat = |m: MatrixId| -> MatrixId {
            match mat_new_id[m.0] {
                Some(id) => id,
                None => m,
            }
        };

        for cmd in &mut self.commands {
            match cmd {
                Command::AllocZeroed(m) | Command::AllocUndefined(m) | Command::Dealloc(m) => {
                    *m = remap_mat(*m);
                }
                Command::AllocFromOther { dst, src, .. } => {
                    *dst = remap_mat(*dst);
                    *src = remap_mat(*src);
                }
                Command::Propagate { input, output, .. } => {
                    *input = remap_sub(*input);
                    *output = remap_sub(*output);
                }
                Command::Backprop {
                    out_deriv,
                    in_deriv,
                    ..
                } => {
                    *out_deriv = remap_sub(*out_deriv);
                    *in_deriv = remap_sub(*in_deriv);
                }
                Command::ModelUpdate {
                    input, out_deriv, ..
                } => {
                    *input = remap_sub(*input);
                    *out_deriv = remap_sub(*out_deriv);
                }
                Command::Copy { dst, src }
                | Command::Add { dst, src }
                | Command::AddRows { dst, src }
                | Command::CopyRows { dst, src } => {
                    *dst = remap_sub(*dst);
                    *src = remap_sub(*src);
                }
                Command::Scale { dst, .. } => {
                    *dst = remap_sub(*dst);
                }
                Command::NoOp => {}
            }
        }

        for sub in &mut new_subs {
            sub.matrix = remap_mat(sub.matrix);
        }

        self.submatrices = new_subs;
        self.matrices = new_mats;
    }

    /// Finalize the computation for repeated execution: validate, strip
    /// tombstones, compact the arenas, and precompute resolved operand
    /// tables. Idempotent.
    pub fn freeze(&mut self) -> Result<(), Error> {
        if self.frozen {
            return Ok(());
        }
        self.strip_noops();
        self.renumber();
        check::check(self)?;
        self.resolved = self
            .commands
            .iter()
            .map(|cmd| {
                cmd.submatrix_operands()
                    .into_iter()
                    .map(|s| {
                        let sub = self.submatrices[s.0];
                        ResolvedOperand {
                            matrix: sub.matrix,
                            row_offset: sub.row_offset,
                            rows: sub.rows,
                            col_offset: sub.col_offset,
                            cols: sub.cols,
                        }
                    })
                    .collect()
            })
            .collect();
        self.frozen = true;
        Ok(())
    }
}

impl fmt::Display for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "matrices:")?;
        for (i, m) in self.matrices.iter().enumerate() {
            let kind = match m.kind {
                AllocKind::Zeroed => "zeroed",
                AllocKind::Undefined => "undefined",
                AllocKind::FromOther { zeroed: true } => "from_other_zeroed",
                AllocKind::FromOther { zeroed: false } => "from_other",
                AllocKind::Pending => "pending",
            };
            writeln!(f, "  m{i}: {}x{} {kind}", m.rows, m.cols)?;
        }
        writeln!(f, "submatrices:")?;
        for (i, s) in self.submatrices.iter().enumerate() {
            writeln!(
                f,
                "  s{i} = {}[{}..{}, {}..{}]",
                s.matrix,
                s.row_offset,
                s.row_offset + s.rows,
                s.col_offset,
                s.col_offset + s.cols
            )?;
        }
        writeln!(f, "commands:")?;
        for (i, c) in self.commands.iter().enumerate() {
            writeln!(f, "  c{i}: {c}")?;
        }
        Ok(())
    }
}

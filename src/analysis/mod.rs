//! Dataflow and liveness analysis over a computation.
//!
//! Produces, for every variable, the ordered list of commands that read or
//! write it, and for every matrix its live window and data-access list. All
//! optimization passes depend on this; every pass entry point computes a
//! fresh [`Analysis`] because any structural edit makes a previous one stale,
//! and stale analysis is a correctness hazard.

pub mod variables;


use crate::ir::{Computation, MatrixId};

pub use variables::{compute_command_attributes, CommandAttributes, ComputationVariables, VariableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    ReadWrite,
}

/// One data access of a variable or matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub command: usize,
    pub access: AccessType,
}

impl Access {
    pub fn is_read(&self) -> bool {
        matches!(self.access, AccessType::Read | AccessType::ReadWrite)
    }

    pub fn is_write(&self) -> bool {
        matches!(self.access, AccessType::Write | AccessType::ReadWrite)
    }
}

/// The sizing commands and data accesses of one matrix.
#[derive(Debug, Clone, Default)]
pub struct MatrixAccesses {
    /// Command index of the allocation (`AllocZeroed`, `AllocUndefined`, or
    /// `AllocFromOther` as destination).
    pub allocate_command: Option<usize>,
    /// Command index of the deallocation (`Dealloc`, or `AllocFromOther` as
    /// source).
    pub deallocate_command: Option<usize>,
    /// Data accesses in command order; sizing commands are not included.
    pub accesses: Vec<Access>,
}

/// Derived analysis of one computation. Never owned by the computation:
/// recomputed from scratch whenever a pass restructures it.
#[derive(Debug)]
pub struct Analysis {
    pub variables: ComputationVariables,
    pub attributes: Vec<CommandAttributes>,
    /// Per variable: data accesses in command order.
    pub variable_accesses: Vec<Vec<Access>>,
    pub matrix_accesses: Vec<MatrixAccesses>,
}

impl Analysis {
    /// Analyze `computation`. The computation must already have passed the
    /// structural checker; the analyzer indexes the arenas directly.
    pub fn compute(computation: &Computation) -> Analysis {
        let variables = ComputationVariables::compute(computation);
        let attributes = compute_command_attributes(computation, &variables);

        let mut variable_accesses: Vec<Vec<Access>> = vec![Vec::new(); variables.num_variables()];
        let mut matrix_accesses: Vec<MatrixAccesses> =
            vec![MatrixAccesses::default(); computation.num_matrices()];

        for (c, attr) in attributes.iter().enumerate() {
            merge_accesses(
                &mut variable_accesses,
                c,
                &attr.variables_read,
                &attr.variables_written,
                |v: &VariableId| *v,
            );
            merge_accesses(
                &mut matrix_accesses,
                c,
                &attr.matrices_read,
                &attr.matrices_written,
                |m: &MatrixId| m.0,
            );
        }

        for (c, cmd) in computation.commands.iter().enumerate() {
            if let Some(m) = cmd.allocated_matrix() {
                matrix_accesses[m.0].allocate_command = Some(c);
            }
            if let Some(m) = cmd.deallocated_matrix() {
                matrix_accesses[m.0].deallocate_command = Some(c);
            }
        }

        Analysis {
            variables,
            attributes,
            variable_accesses,
            matrix_accesses,
        }
    }

    /// Index of the first data access of `m`, if any.
    pub fn first_data_access(&self, m: MatrixId) -> Option<usize> {
        self.matrix_accesses[m.0].accesses.first().map(|a| a.command)
    }

    /// Index of the last data access of `m`, if any.
    pub fn last_data_access(&self, m: MatrixId) -> Option<usize> {
        self.matrix_accesses[m.0].accesses.last().map(|a| a.command)
    }

    /// Whether `m` has a data access strictly before command `c`.
    pub fn matrix_accessed_before(&self, m: MatrixId, c: usize) -> bool {
        matches!(self.first_data_access(m), Some(first) if first < c)
    }

    /// Whether `m` has a data access strictly after command `c`.
    pub fn matrix_accessed_after(&self, m: MatrixId, c: usize) -> bool {
        matches!(self.last_data_access(m), Some(last) if last > c)
    }

    /// The matrix's live window: allocation to deallocation command index.
    pub fn live_interval(&self, m: MatrixId) -> Option<(usize, usize)> {
        let acc = &self.matrix_accesses[m.0];
        match (acc.allocate_command, acc.deallocate_command) {
            (Some(a), Some(d)) => Some((a, d)),
            _ => None,
        }
    }
}

/// Fold per-command read and write id lists into ordered access lists,
/// collapsing a read and a write by the same command into one `ReadWrite`.
fn merge_accesses<T, K>(
    accesses: &mut [T],
    command: usize,
    read: &[K],
    written: &[K],
    index: impl Fn(&K) -> usize,
) where
    T: AccessList,
{
    for r in read {
        accesses[index(r)].push(Access {
            command,
            access: AccessType::Read,
        });
    }
    for w in written {
        let list = &mut accesses[index(w)];
        match list.last_mut() {
            Some(last) if last.command == command => {
                last.access = match last.access {
                    AccessType::Read => AccessType::ReadWrite,
                    other => other,
                };
            }
            _ => list.push(Access {
                command,
                access: AccessType::Write,
            }),
        }
    }
}

/// Internal: lets `merge_accesses` fill both the per-variable lists and the
/// per-matrix access records with one implementation.
trait AccessList {
    fn push(&mut self, access: Access);
    fn last_mut(&mut self) -> Option<&mut Access>;
}

impl AccessList for Vec<Access> {
    fn push(&mut self, access: Access) {
        Vec::push(self, access);
    }

    fn last_mut(&mut self) -> Option<&mut Access> {
        self.as_mut_slice().last_mut()
    }
}

impl AccessList for MatrixAccesses {
    fn push(&mut self, access: Access) {
        self.accesses.push(access);
    }

    fn last_mut(&mut self) -> Option<&mut Access> {
        self.accesses.last_mut()
    }
}

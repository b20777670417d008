//! Model-update consolidation.
//!
//! A recurrent computation unrolled over T time steps emits T structurally
//! identical `ModelUpdate` commands per parameter, each over a small row
//! block. This pass replaces each such group with copies of the per-step
//! operands into two freshly allocated concatenation matrices (original time
//! order preserved) and a single update over the concatenations, turning T
//! small kernel launches into one large one.
//!
//! The rewrite is one-shot and non-idempotent: the concatenation copies it
//! inserts would themselves be swept up by a second run. The computation
//! carries an explicit state machine for this; invoking the pass twice is a
//! contract violation and fails fatally.

use std::collections::{BTreeMap, HashMap};

use crate::error::Error;
use crate::ir::{check, AllocKind, Command, Computation, ConsolidationState};

pub fn consolidate_model_update(computation: &mut Computation) -> Result<(), Error> {
    if computation.consolidation_state() == ConsolidationState::Consolidated {
        return Err(Error::AlreadyConsolidated);
    }
    check::check(computation)?;
    computation.set_consolidation_state(ConsolidationState::Consolidated);

    // Group update commands by parameter and operand column counts. Row
    // counts may vary per step; column counts are part of the update's
    // structure and must agree for the operands to concatenate.
    let mut groups: BTreeMap<(u32, usize, usize), Vec<usize>> = BTreeMap::new();
    for (c, cmd) in computation.commands.iter().enumerate() {
        if let Command::ModelUpdate {
            param,
            input,
            out_deriv,
        } = *cmd
        {
            let in_sub = computation.submatrix(input);
            let od_sub = computation.submatrix(out_deriv);
            if in_sub.rows != od_sub.rows {
                continue;
            }
            groups
                .entry((param.0, in_sub.cols, od_sub.cols))
                .or_default()
                .push(c);
        }
    }

    let mut insert_before: HashMap<usize, Vec<Command>> = HashMap::new();
    let mut insert_after: HashMap<usize, Vec<Command>> = HashMap::new();
    let mut replace: HashMap<usize, Vec<Command>> = HashMap::new();

    for ((_, in_cols, od_cols), members) in groups {
        // A lone update gains nothing from consolidation.
        if members.len() < 2 {
            continue;
        }
        let total_rows: usize = members
            .iter()
            .map(|&c| match computation.commands[c] {
                Command::ModelUpdate { input, .. } => computation.submatrix(input).rows,
                _ => 0,
            })
            .sum();

        let concat_in = computation.new_matrix(total_rows, in_cols, AllocKind::Undefined);
        let concat_od = computation.new_matrix(total_rows, od_cols, AllocKind::Undefined);
        let whole_in = computation.whole_submatrix(concat_in);
        let whole_od = computation.whole_submatrix(concat_od);

        let mut param = None;
        let mut row = 0;
        for &c in &members {
            let Command::ModelUpdate {
                param: p,
                input,
                out_deriv,
            } = computation.commands[c]
            else {
                continue;
            };
            param = Some(p);
            let rows = computation.submatrix(input).rows;
            let in_block = computation.new_submatrix(concat_in, row, rows, 0, in_cols);
            let od_block = computation.new_submatrix(concat_od, row, rows, 0, od_cols);
            row += rows;
            replace.insert(
                c,
                vec![
                    Command::Copy {
                        dst: in_block,
                        src: input,
                    },
                    Command::Copy {
                        dst: od_block,
                        src: out_deriv,
                    },
                ],
            );
        }
        let Some(param) = param else { continue };

        insert_before
            .entry(members[0])
            .or_default()
            .extend([
                Command::AllocUndefined(concat_in),
                Command::AllocUndefined(concat_od),
            ]);
        insert_after
            .entry(*members.last().unwrap_or(&members[0]))
            .or_default()
            .extend([
                Command::ModelUpdate {
                    param,
                    input: whole_in,
                    out_deriv: whole_od,
                },
                Command::Dealloc(concat_in),
                Command::Dealloc(concat_od),
            ]);
    }

    if replace.is_empty() {
        return Ok(());
    }

    let old = std::mem::take(&mut computation.commands);
    let mut commands = Vec::with_capacity(old.len() + insert_before.len() * 5);
    for (c, cmd) in old.into_iter().enumerate() {
        if let Some(pre) = insert_before.remove(&c) {
            commands.extend(pre);
        }
        match replace.remove(&c) {
            Some(seq) => commands.extend(seq),
            None => commands.push(cmd),
        }
        if let Some(post) = insert_after.remove(&c) {
            commands.extend(post);
        }
    }
    computation.commands = commands;
    Ok(())
}

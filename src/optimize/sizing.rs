//! Sizing-command motion.
//!
//! Slides every allocation as late, and every deallocation as early, as the
//! live-interval data permits: an allocation lands immediately before its
//! matrix's first data access, a deallocation immediately after the last.
//! This shrinks the window during which each matrix occupies memory without
//! touching the relative order of any other commands.
//!
//! Implemented as a stable re-sort: every command gets a key of three times
//! its index, sizing commands get keys adjacent to their matrix's boundary
//! accesses, and stability preserves the original order among commands that
//! share a key.

use crate::analysis::Analysis;
use crate::error::Error;
use crate::ir::{check, Command, Computation};

pub fn move_sizing_commands(computation: &mut Computation) -> Result<(), Error> {
    check::check(computation)?;
    let analysis = Analysis::compute(computation);

    let mut keyed: Vec<(usize, Command)> = std::mem::take(&mut computation.commands)
        .into_iter()
        .enumerate()
        .map(|(c, cmd)| {
            let key = match cmd {
                // An allocate-from-other is pinned between two matrices'
                // windows and is not moved.
                Command::AllocZeroed(m) | Command::AllocUndefined(m) => {
                    match analysis.first_data_access(m) {
                        Some(first) => 3 * first,
                        None => 3 * c + 1,
                    }
                }
                Command::Dealloc(m) => match analysis.last_data_access(m) {
                    Some(last) => 3 * last + 2,
                    None => 3 * c + 1,
                },
                _ => 3 * c + 1,
            };
            (key, cmd)
        })
        .collect();

    keyed.sort_by_key(|&(key, _)| key);
    computation.commands = keyed.into_iter().map(|(_, cmd)| cmd).collect();
    Ok(())
}

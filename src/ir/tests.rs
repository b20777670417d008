use super::check::check;
use super::*;

/// alloc m0 -> scale m0 -> copy m1 <- m0 -> dealloc both.
fn two_matrix_computation() -> Computation {
    let mut comp = Computation::new();
    let m0 = comp.new_matrix(4, 3, AllocKind::Zeroed);
    let m1 = comp.new_matrix(4, 3, AllocKind::Zeroed);
    let s0 = comp.whole_submatrix(m0);
    let s1 = comp.whole_submatrix(m1);
    comp.commands = vec![
        Command::AllocZeroed(m0),
        Command::AllocZeroed(m1),
        Command::Copy { dst: s1, src: s0 },
        Command::Scale {
            dst: s1,
            factor: 2.0,
        },
        Command::Dealloc(m0),
        Command::Dealloc(m1),
    ];
    comp
}

#[test]
fn valid_computation_passes_check() {
    let comp = two_matrix_computation();
    assert!(check(&comp).is_ok());
}

#[test]
fn check_rejects_dangling_matrix_reference() {
    let mut comp = two_matrix_computation();
    comp.submatrix_mut(SubmatrixId(0)).matrix = MatrixId(9);
    assert!(matches!(check(&comp), Err(crate::Error::Check(_))));
}

#[test]
fn check_rejects_out_of_bounds_submatrix() {
    let mut comp = two_matrix_computation();
    comp.submatrix_mut(SubmatrixId(0)).rows = 5;
    assert!(check(&comp).is_err());
}

#[test]
fn check_rejects_access_outside_live_window() {
    let mut comp = two_matrix_computation();
    // Move the copy after m0's deallocation.
    comp.commands.swap(2, 4);
    assert!(check(&comp).is_err());
}

#[test]
fn check_rejects_double_allocation() {
    let mut comp = two_matrix_computation();
    comp.commands[1] = Command::AllocZeroed(MatrixId(0));
    assert!(check(&comp).is_err());
}

#[test]
fn check_rejects_missing_deallocation() {
    let mut comp = two_matrix_computation();
    comp.commands[5] = Command::NoOp;
    assert!(check(&comp).is_err());
}

#[test]
fn check_rejects_kind_mismatch() {
    let mut comp = two_matrix_computation();
    comp.matrix_mut(MatrixId(0)).kind = AllocKind::Undefined;
    assert!(check(&comp).is_err());
}

#[test]
fn renumber_deduplicates_submatrices_and_drops_dead_matrices() {
    let mut comp = two_matrix_computation();
    // A duplicate of s0 and a matrix nothing references.
    let m0 = MatrixId(0);
    let dup = comp.whole_submatrix(m0);
    comp.new_matrix(7, 7, AllocKind::Undefined);
    if let Command::Copy { src, .. } = &mut comp.commands[2] {
        *src = dup;
    }
    comp.renumber();
    assert_eq!(comp.num_submatrices(), 2);
    assert_eq!(comp.num_matrices(), 2);
    assert!(check(&comp).is_ok());
}

#[test]
fn freeze_strips_tombstones_and_resolves_operands() {
    let mut comp = two_matrix_computation();
    comp.commands.insert(2, Command::NoOp);
    comp.freeze().unwrap();
    assert!(comp.is_frozen());
    assert_eq!(comp.commands.len(), 6);
    assert!(!comp.commands.iter().any(|c| *c == Command::NoOp));
    // c2 is the copy: operands resolve to whole 4x3 views.
    let ops = comp.resolved_operands(2);
    assert_eq!(ops.len(), 2);
    assert_eq!((ops[0].rows, ops[0].cols), (4, 3));
    assert_eq!(ops[0].matrix, MatrixId(0));
    assert_eq!(ops[1].matrix, MatrixId(1));
}

#[test]
fn freeze_is_idempotent() {
    let mut comp = two_matrix_computation();
    comp.freeze().unwrap();
    let before = comp.clone();
    comp.freeze().unwrap();
    assert_eq!(comp, before);
}

#[test]
fn display_lists_arenas_and_commands() {
    let comp = two_matrix_computation();
    insta::assert_snapshot!(comp.to_string(), @r"
    matrices:
      m0: 4x3 zeroed
      m1: 4x3 zeroed
    submatrices:
      s0 = m0[0..4, 0..3]
      s1 = m1[0..4, 0..3]
    commands:
      c0: alloc_zeroed m0
      c1: alloc_zeroed m1
      c2: copy s1 <- s0
      c3: scale s1 *= 2
      c4: dealloc m0
      c5: dealloc m1
    ");
}

//! End-to-end check that optimization never changes what a computation
//! computes. A small reference executor interprets the IR over f32 buffers;
//! an unrolled recurrent-style computation is run unoptimized and under a
//! range of configurations, and the observable results are compared
//! bit-for-bit.

use std::collections::HashMap;

use gradix::ir::{AllocKind, Command, Computation, MatrixId, OpId, ParamId, SubmatrixId};
use gradix::{optimize, Error, OptimizeConfig};

/// Fill value for uninitialized allocations. Any result that depends on
/// uninitialized memory blows up visibly instead of comparing equal by luck.
const CANARY: f32 = 1e30;

// ── Reference executor ──

/// Deterministic per-cell contribution of kernel `op`, position-dependent so
/// that reordered or misaddressed accesses change the result.
fn kernel_term(op: OpId, i: usize, j: usize) -> f32 {
    (op.0 + 1) as f32 * (0.25 + 0.125 * i as f32 + 0.0625 * j as f32)
}

struct Executor {
    buffers: HashMap<usize, Vec<f32>>,
    params: HashMap<u32, Vec<f32>>,
    /// Contents of each buffer at the moment its matrix's lifetime ends.
    captures: Vec<Vec<f32>>,
    live: usize,
    peak_live: usize,
}

impl Executor {
    fn new() -> Executor {
        Executor {
            buffers: HashMap::new(),
            params: HashMap::new(),
            captures: Vec::new(),
            live: 0,
            peak_live: 0,
        }
    }

    fn alloc(&mut self, comp: &Computation, m: MatrixId, data: Vec<f32>) {
        let shape = comp.matrix(m);
        assert_eq!(data.len(), shape.rows * shape.cols);
        let prev = self.buffers.insert(m.0, data);
        assert!(prev.is_none(), "double allocation of {m}");
        self.live += 1;
        self.peak_live = self.peak_live.max(self.live);
    }

    fn release(&mut self, m: MatrixId) -> Vec<f32> {
        let buf = self.buffers.remove(&m.0).unwrap_or_else(|| panic!("{m} not allocated"));
        self.captures.push(buf.clone());
        self.live -= 1;
        buf
    }

    /// Read submatrix `s` as a dense row-major region.
    fn read_region(&self, comp: &Computation, s: SubmatrixId) -> Vec<f32> {
        let sub = comp.submatrix(s);
        let stride = comp.matrix(sub.matrix).cols;
        let buf = &self.buffers[&sub.matrix.0];
        let mut out = Vec::with_capacity(sub.rows * sub.cols);
        for i in 0..sub.rows {
            for j in 0..sub.cols {
                out.push(buf[(sub.row_offset + i) * stride + sub.col_offset + j]);
            }
        }
        out
    }

    fn write_region(&mut self, comp: &Computation, s: SubmatrixId, f: impl Fn(usize, usize, f32) -> f32) {
        let sub = *comp.submatrix(s);
        let stride = comp.matrix(sub.matrix).cols;
        let buf = self.buffers.get_mut(&sub.matrix.0).unwrap();
        for i in 0..sub.rows {
            for j in 0..sub.cols {
                let cell = &mut buf[(sub.row_offset + i) * stride + sub.col_offset + j];
                *cell = f(i, j, *cell);
            }
        }
    }

    fn run(&mut self, comp: &Computation) {
        for cmd in &comp.commands {
            self.step(comp, cmd);
        }
        assert_eq!(self.live, 0, "matrices left allocated at end of run");
    }

    fn step(&mut self, comp: &Computation, cmd: &Command) {
        match *cmd {
            Command::AllocZeroed(m) => {
                let shape = comp.matrix(m);
                self.alloc(comp, m, vec![0.0; shape.rows * shape.cols]);
            }
            Command::AllocUndefined(m) => {
                let shape = comp.matrix(m);
                self.alloc(comp, m, vec![CANARY; shape.rows * shape.cols]);
            }
            Command::AllocFromOther { dst, src, zeroed } => {
                let mut buf = self.release(src);
                if zeroed {
                    buf.fill(0.0);
                }
                self.alloc(comp, dst, buf);
            }
            Command::Dealloc(m) => {
                self.release(m);
            }
            // Kernels read their whole source region before writing, so
            // in-place execution (input aliasing output) behaves exactly
            // like the two-buffer form.
            Command::Propagate { op, input, output } => {
                let src = self.read_region(comp, input);
                let (sr, sc) = {
                    let sub = comp.submatrix(input);
                    (sub.rows, sub.cols)
                };
                self.write_region(comp, output, |i, j, _| {
                    src[(i % sr) * sc + j % sc] * 1.5 + kernel_term(op, i, j)
                });
            }
            Command::Backprop {
                op,
                out_deriv,
                in_deriv,
            } => {
                let src = self.read_region(comp, out_deriv);
                let (sr, sc) = {
                    let sub = comp.submatrix(out_deriv);
                    (sub.rows, sub.cols)
                };
                self.write_region(comp, in_deriv, |i, j, _| {
                    src[(i % sr) * sc + j % sc] * 0.5 - kernel_term(op, i, j)
                });
            }
            Command::ModelUpdate {
                param,
                input,
                out_deriv,
            } => {
                let x = self.read_region(comp, input);
                let od = self.read_region(comp, out_deriv);
                let in_sub = comp.submatrix(input);
                let od_sub = comp.submatrix(out_deriv);
                assert_eq!(in_sub.rows, od_sub.rows);
                let w = self
                    .params
                    .entry(param.0)
                    .or_insert_with(|| vec![0.0; in_sub.cols * od_sub.cols]);
                // Row-by-row accumulation: a consolidated update over
                // concatenated blocks adds in exactly the same order as the
                // per-block updates it replaced.
                for i in 0..in_sub.rows {
                    for j in 0..in_sub.cols {
                        for k in 0..od_sub.cols {
                            w[j * od_sub.cols + k] += x[i * in_sub.cols + j] * od[i * od_sub.cols + k];
                        }
                    }
                }
            }
            Command::Copy { dst, src } | Command::CopyRows { dst, src } => {
                let data = self.read_region(comp, src);
                let cols = comp.submatrix(src).cols;
                assert_eq!(comp.submatrix(dst).cols, cols);
                self.write_region(comp, dst, |i, j, _| data[i * cols + j]);
            }
            Command::Add { dst, src } | Command::AddRows { dst, src } => {
                let data = self.read_region(comp, src);
                let cols = comp.submatrix(src).cols;
                assert_eq!(comp.submatrix(dst).cols, cols);
                self.write_region(comp, dst, |i, j, old| old + data[i * cols + j]);
            }
            Command::Scale { dst, factor } => {
                self.write_region(comp, dst, |_, _, old| old * factor);
            }
            Command::NoOp => {}
        }
    }
}

// ── Test computation ──

/// An unrolled recurrent-style computation over `t` time steps.
///
/// A zeroed seed is pushed through a forward op to give the unrolled input
/// `x` nonzero, position-dependent contents. Each step propagates one 2-row
/// block of `x` into a fresh activation, copies it, scales the copy,
/// backprops it into a derivative matrix, and accumulates a model update.
/// The last step also propagates into a long-lived output matrix whose
/// unique 4x5 shape makes its final contents easy to find among the
/// captures.
///
/// By construction every pass has work here: the per-step copy is a merge
/// candidate, forward and backward ops can run in place, the derivative
/// matrices are fully overwritten before being read, per-step matrices of
/// one shape die and get reborn, and all `t` model updates hit the same
/// parameter.
fn build_recurrent(t: usize) -> Computation {
    assert!(t >= 2);
    let mut comp = Computation::new();
    let seed = comp.new_matrix(2 * t, 3, AllocKind::Zeroed);
    let x = comp.new_matrix(2 * t, 3, AllocKind::Zeroed);
    let y = comp.new_matrix(4, 5, AllocKind::Zeroed);
    let whole_seed = comp.whole_submatrix(seed);
    let whole_x = comp.whole_submatrix(x);
    let whole_y = comp.whole_submatrix(y);

    let mut commands = vec![
        Command::AllocZeroed(seed),
        Command::AllocZeroed(x),
        Command::Propagate {
            op: OpId(9),
            input: whole_seed,
            output: whole_x,
        },
        Command::Dealloc(seed),
        Command::AllocZeroed(y),
    ];

    for k in 0..t {
        let x_block = comp.new_submatrix(x, 2 * k, 2, 0, 3);
        let act = comp.new_matrix(2, 4, AllocKind::Zeroed);
        let copy = comp.new_matrix(2, 4, AllocKind::Zeroed);
        let deriv = comp.new_matrix(2, 4, AllocKind::Zeroed);
        let whole_act = comp.whole_submatrix(act);
        let whole_copy = comp.whole_submatrix(copy);
        let whole_deriv = comp.whole_submatrix(deriv);

        commands.extend([
            Command::AllocZeroed(act),
            Command::Propagate {
                op: OpId(0),
                input: x_block,
                output: whole_act,
            },
            Command::AllocZeroed(copy),
            Command::Copy {
                dst: whole_copy,
                src: whole_act,
            },
            Command::Dealloc(act),
            Command::Scale {
                dst: whole_copy,
                factor: 1.5,
            },
            Command::AllocZeroed(deriv),
            Command::Backprop {
                op: OpId(1),
                out_deriv: whole_copy,
                in_deriv: whole_deriv,
            },
            Command::ModelUpdate {
                param: ParamId(0),
                input: x_block,
                out_deriv: whole_deriv,
            },
        ]);
        if k + 1 == t {
            commands.push(Command::Propagate {
                op: OpId(2),
                input: whole_copy,
                output: whole_y,
            });
        }
        commands.push(Command::Dealloc(copy));
        commands.push(Command::Dealloc(deriv));
    }

    commands.push(Command::Dealloc(x));
    commands.push(Command::Dealloc(y));
    comp.commands = commands;
    comp
}

struct RunResult {
    params: HashMap<u32, Vec<f32>>,
    /// Final contents of the 4x5 output matrix.
    output: Vec<f32>,
    peak_live: usize,
}

fn run(comp: &Computation) -> RunResult {
    let mut exec = Executor::new();
    exec.run(comp);
    let outputs: Vec<&Vec<f32>> = exec.captures.iter().filter(|b| b.len() == 20).collect();
    assert_eq!(outputs.len(), 1, "expected exactly one 4x5 capture");
    RunResult {
        output: outputs[0].clone(),
        params: exec.params,
        peak_live: exec.peak_live,
    }
}

fn run_optimized(config: &OptimizeConfig, t: usize) -> RunResult {
    let mut comp = build_recurrent(t);
    optimize(config, &mut comp).unwrap();
    comp.freeze().unwrap();
    run(&comp)
}

// ── Tests ──

#[test]
fn optimized_results_match_unoptimized_bit_for_bit() {
    let t = 6;
    let reference = run(&build_recurrent(t));
    assert!(!reference.params[&0].iter().all(|v| *v == 0.0));
    assert!(reference.output.iter().all(|v| v.abs() < CANARY));

    let mut configs = vec![
        OptimizeConfig::default(),
        OptimizeConfig {
            optimize: false,
            ..OptimizeConfig::default()
        },
    ];
    // Each pass disabled on its own.
    for flag in 0..9 {
        let mut config = OptimizeConfig::default();
        match flag {
            0 => config.consolidate_model_update = false,
            1 => config.propagate_in_place = false,
            2 => config.backprop_in_place = false,
            3 => config.remove_assignments = false,
            4 => config.allow_left_merge = false,
            5 => config.allow_right_merge = false,
            6 => config.initialize_undefined = false,
            7 => config.move_sizing_commands = false,
            _ => config.allocate_from_other = false,
        }
        configs.push(config);
    }

    for config in &configs {
        let result = run_optimized(config, t);
        assert_eq!(result.params, reference.params, "params diverged: {config:?}");
        assert_eq!(result.output, reference.output, "output diverged: {config:?}");
    }
}

#[test]
fn optimization_does_not_increase_peak_memory() {
    let t = 8;
    let reference = run(&build_recurrent(t));
    let optimized = run_optimized(&OptimizeConfig::default(), t);
    assert!(optimized.peak_live <= reference.peak_live);
}

#[test]
fn default_pipeline_rewrites_the_computation() {
    let mut comp = build_recurrent(4);
    let unoptimized = comp.commands.len();
    optimize(&OptimizeConfig::default(), &mut comp).unwrap();
    comp.freeze().unwrap();
    // Merging removed copies, consolidation collapsed the updates, and
    // reuse converted some allocations into handoffs.
    assert!(comp.commands.len() < unoptimized);
    let updates = comp
        .commands
        .iter()
        .filter(|c| matches!(c, Command::ModelUpdate { .. }))
        .count();
    assert_eq!(updates, 1);
    assert!(comp
        .commands
        .iter()
        .any(|c| matches!(c, Command::AllocFromOther { .. })));
}

#[test]
fn optimizing_twice_reports_the_consolidation_conflict() {
    let mut comp = build_recurrent(4);
    let config = OptimizeConfig::default();
    optimize(&config, &mut comp).unwrap();
    assert!(matches!(
        optimize(&config, &mut comp),
        Err(Error::AlreadyConsolidated)
    ));
}

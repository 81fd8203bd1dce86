// LLVM Pipeline Tests — Horizontal fusion, outer-loop parallelization,
// and vectorization markers
//
// This binary registers an interpreting stand-in under the LLVM codegen
// name, so CPU kernels take the LLVM scheduling path (fuse, parallelize,
// vectorize) while still executing through the IR evaluator. Structure is
// asserted on `scheduled_stmt`; numerics on the call results.

use vole::schedule::{prune_by_grain_size, prune_by_thread_count};
use vole::{register_codegen, CompileConfig, Kernel, LoweringRegistry, Stack, StackValue};
use vole_core::{DType, Device, Result, Tensor};
use vole_expr::{BufferArg, CodeGen, For, SimpleIrEval, Stmt};
use vole_ir::{ConstantValue, GraphBuilder, OpKind, TensorType, ValueType};

fn interpreting_stub(
    stmt: Stmt,
    args: Vec<BufferArg>,
    _device: Device,
    name: String,
) -> Result<Box<dyn CodeGen>> {
    Ok(Box::new(SimpleIrEval::new(stmt, args, name)))
}

fn with_llvm() {
    register_codegen("llvm_codegen", interpreting_stub);
}

fn tensor_ty(sizes: &[i64]) -> ValueType {
    ValueType::Tensor(TensorType::complete(sizes.to_vec(), DType::F32, Device::Cpu))
}

/// x * 2 + 3 over the given shape.
fn chain_graph(sizes: &[i64]) -> vole_ir::Graph {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", sizes, DType::F32, Device::Cpu);
    let two = g.constant("two", ConstantValue::Int(2));
    let three = g.constant("three", ConstantValue::Int(3));
    let scaled = g.node(OpKind::Mul, &[x, two], tensor_ty(sizes), "scaled");
    let shifted = g.node(OpKind::Add, &[scaled, three], tensor_ty(sizes), "shifted");
    g.output(shifted);
    g.build()
}

fn compile(graph: vole_ir::Graph) -> Kernel {
    with_llvm();
    Kernel::new(
        graph,
        "fused_kernel",
        LoweringRegistry::new(),
        vec![],
        false,
        CompileConfig::default(),
    )
    .expect("kernel compilation failed")
}

fn collect_loops(stmt: &Stmt, out: &mut Vec<For>) {
    match stmt {
        Stmt::For(l) => {
            out.push((**l).clone());
            collect_loops(&l.body, out);
        }
        Stmt::Block(stmts) => {
            for s in stmts {
                collect_loops(s, out);
            }
        }
        Stmt::Cond {
            if_true, if_false, ..
        } => {
            collect_loops(if_true, out);
            if let Some(e) = if_false {
                collect_loops(e, out);
            }
        }
        _ => {}
    }
}

fn loops_of(kernel: &Kernel) -> Vec<For> {
    let mut out = Vec::new();
    collect_loops(kernel.scheduled_stmt().expect("no scheduled stmt"), &mut out);
    out
}

fn run_one(kernel: &Kernel, inputs: Vec<StackValue>) -> Tensor {
    let mut stack: Stack = inputs;
    kernel.run(&mut stack).expect("kernel run failed");
    match stack.pop() {
        Some(StackValue::Tensor(t)) => t,
        other => panic!("expected a tensor output, got {:?}", other),
    }
}

// Pruning heuristics

#[test]
fn grain_size_pruning() {
    // [1024]: the whole nest is below the grain.
    let mut trips = vec![Some(1024i64)];
    prune_by_grain_size(&mut trips);
    assert!(trips.is_empty());

    // [2, 16, 1024]: 2*16*1024 lands exactly on the grain boundary, which
    // is still not worth a thread.
    let mut trips = vec![Some(2i64), Some(16), Some(1024)];
    prune_by_grain_size(&mut trips);
    assert!(trips.is_empty());

    // [256, 1024]: 256*1024 clears the grain; the outer loop survives.
    let mut trips = vec![Some(256i64), Some(1024)];
    prune_by_grain_size(&mut trips);
    assert_eq!(trips, vec![Some(256)]);

    // Symbolic extents stop the scan.
    let mut trips = vec![None, Some(8i64)];
    prune_by_grain_size(&mut trips);
    assert_eq!(trips, vec![None]);
}

#[test]
fn thread_count_pruning() {
    let mut trips = vec![Some(256i64), Some(1024)];
    prune_by_thread_count(&mut trips, 8);
    assert_eq!(trips, vec![Some(256)]);

    let mut trips = vec![Some(2i64), Some(4), Some(8)];
    prune_by_thread_count(&mut trips, 8);
    assert_eq!(trips, vec![Some(2), Some(4)]);
}

// Parallelization scenarios

#[test]
fn small_1d_kernel_is_not_parallelized() {
    let kernel = compile(chain_graph(&[1024]));
    let loops = loops_of(&kernel);
    assert!(
        loops.iter().all(|l| !l.options.parallel),
        "1024 elements are below the grain size; no loop may be parallel"
    );
    // The inner loop still gets the vectorization marker.
    assert!(loops.iter().any(|l| l.options.vectorized));

    let input: Vec<f32> = (0..1024).map(|i| i as f32).collect();
    let expected: Vec<f32> = input.iter().map(|x| x * 2.0 + 3.0).collect();
    let out = run_one(
        &kernel,
        vec![StackValue::Tensor(
            Tensor::from_f32(input, &[1024], Device::Cpu).unwrap(),
        )],
    );
    assert_eq!(out.as_f32().unwrap(), expected.as_slice());
}

#[test]
fn grain_boundary_kernel_is_not_parallelized() {
    // 2*16*1024 = 32768 sits exactly on the grain size.
    let kernel = compile(chain_graph(&[2, 16, 1024]));
    let loops = loops_of(&kernel);
    assert!(loops.iter().all(|l| !l.options.parallel));
}

#[test]
fn large_2d_kernel_parallelizes_the_outer_loop() {
    let kernel = compile(chain_graph(&[256, 1024]));
    let loops = loops_of(&kernel);
    let parallel: Vec<&For> = loops.iter().filter(|l| l.options.parallel).collect();
    assert_eq!(parallel.len(), 1, "exactly one parallel loop expected");
    assert_eq!(parallel[0].stop.as_long(), Some(256));

    let input: Vec<f32> = (0..256 * 1024).map(|i| (i % 97) as f32).collect();
    let expected: Vec<f32> = input.iter().map(|x| x * 2.0 + 3.0).collect();
    let out = run_one(
        &kernel,
        vec![StackValue::Tensor(
            Tensor::from_f32(input, &[256, 1024], Device::Cpu).unwrap(),
        )],
    );
    assert_eq!(out.as_f32().unwrap(), expected.as_slice());
}

// Horizontal fusion

#[test]
fn sibling_output_loops_fuse_when_bounds_match() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[8, 16], DType::F32, Device::Cpu);
    let two = g.constant("two", ConstantValue::Int(2));
    let three = g.constant("three", ConstantValue::Int(3));
    let y1 = g.node(OpKind::Mul, &[x, two], tensor_ty(&[8, 16]), "y1");
    let y2 = g.node(OpKind::Add, &[x, three], tensor_ty(&[8, 16]), "y2");
    g.output(y1);
    g.output(y2);
    let kernel = compile(g.build());

    // One fused nest: two loops deep, both stores inside the innermost.
    let loops = loops_of(&kernel);
    assert_eq!(loops.len(), 2, "expected a single two-deep fused nest");

    let input: Vec<f32> = (0..128).map(|i| i as f32).collect();
    let mut stack: Stack = vec![StackValue::Tensor(
        Tensor::from_f32(input.clone(), &[8, 16], Device::Cpu).unwrap(),
    )];
    kernel.run(&mut stack).unwrap();
    assert_eq!(stack.len(), 2);
    let y2 = stack.pop().unwrap();
    let y1 = stack.pop().unwrap();
    let exp1: Vec<f32> = input.iter().map(|x| x * 2.0).collect();
    let exp2: Vec<f32> = input.iter().map(|x| x + 3.0).collect();
    assert_eq!(y1.as_tensor().unwrap().as_f32().unwrap(), exp1.as_slice());
    assert_eq!(y2.as_tensor().unwrap().as_f32().unwrap(), exp2.as_slice());
}

#[test]
fn mismatched_bounds_do_not_fuse() {
    let mut g = GraphBuilder::new();
    let a = g.tensor_input("a", &[8], DType::F32, Device::Cpu);
    let b = g.tensor_input("b", &[16], DType::F32, Device::Cpu);
    let two = g.constant("two", ConstantValue::Int(2));
    let y1 = g.node(OpKind::Mul, &[a, two], tensor_ty(&[8]), "y1");
    let y2 = g.node(OpKind::Mul, &[b, two], tensor_ty(&[16]), "y2");
    g.output(y1);
    g.output(y2);
    let kernel = compile(g.build());

    // Two separate top-level loops with their original bounds.
    let loops = loops_of(&kernel);
    assert_eq!(loops.len(), 2);
    let stops: Vec<Option<i64>> = loops.iter().map(|l| l.stop.as_long()).collect();
    assert!(stops.contains(&Some(8)) && stops.contains(&Some(16)));
}

// Reductions

#[test]
fn reductions_are_neither_parallelized_nor_vectorized() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[512, 1024], DType::F32, Device::Cpu);
    let total = g.node(OpKind::Sum, &[x], tensor_ty(&[]), "total");
    g.output(total);
    let kernel = compile(g.build());

    let loops = loops_of(&kernel);
    assert!(!loops.is_empty());
    assert!(loops.iter().all(|l| !l.options.parallel));
    assert!(loops.iter().all(|l| !l.options.vectorized));

    let input = vec![0.5f32; 512 * 1024];
    let out = run_one(
        &kernel,
        vec![StackValue::Tensor(
            Tensor::from_f32(input, &[512, 1024], Device::Cpu).unwrap(),
        )],
    );
    assert!((out.as_f32().unwrap()[0] - 262144.0).abs() < 1.0);
}

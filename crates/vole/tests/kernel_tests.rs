// Kernel Tests — Compile-and-run through the interpreter backend
//
// No optimizing codegen is registered in this binary, so CPU kernels
// select the simple IR evaluator; numeric results are compared against
// hand-computed values and against the fallback graph interpreter.

use vole::{CompileConfig, Kernel, LoweringRegistry, Stack, StackValue};
use vole_core::{contiguous_strides, DType, Device, Error, Tensor, TensorData};
use vole_ir::{
    ConstantValue, GraphBuilder, OpKind, ShapeSym, TensorType, ValueType,
};

// Helpers

fn tensor_ty(sizes: &[i64]) -> ValueType {
    ValueType::Tensor(TensorType::complete(sizes.to_vec(), DType::F32, Device::Cpu))
}

fn compile(graph: vole_ir::Graph) -> Kernel {
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

fn run_one(kernel: &Kernel, inputs: Vec<StackValue>) -> Tensor {
    let mut stack: Stack = inputs;
    kernel.run(&mut stack).expect("kernel run failed");
    assert_eq!(stack.len(), 1);
    match stack.pop() {
        Some(StackValue::Tensor(t)) => t,
        other => panic!("expected a tensor output, got {:?}", other),
    }
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() < tol,
            "elem {}: {} vs {} (tol={})",
            i,
            x,
            y,
            tol
        );
    }
}

// Basic elementwise kernels

#[test]
fn add_two_contiguous_tensors() {
    let mut g = GraphBuilder::new();
    let a = g.tensor_input("a", &[4, 4], DType::F32, Device::Cpu);
    let b = g.tensor_input("b", &[4, 4], DType::F32, Device::Cpu);
    let sum = g.node(OpKind::Add, &[a, b], tensor_ty(&[4, 4]), "sum");
    g.output(sum);
    let kernel = compile(g.build());

    let out = run_one(
        &kernel,
        vec![
            StackValue::Tensor(Tensor::full_f32(&[4, 4], 1.0, Device::Cpu)),
            StackValue::Tensor(Tensor::full_f32(&[4, 4], 1.0, Device::Cpu)),
        ],
    );
    assert_eq!(out.sizes(), &[4, 4]);
    assert_eq!(out.strides(), contiguous_strides(&[4, 4]).as_slice());
    assert_eq!(out.as_f32().unwrap(), vec![2.0f32; 16].as_slice());
}

#[test]
fn elementwise_chain_with_scalar_constants() {
    // x * 2 + 3 over [1024].
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[1024], DType::F32, Device::Cpu);
    let two = g.constant("two", ConstantValue::Int(2));
    let three = g.constant("three", ConstantValue::Int(3));
    let scaled = g.node(OpKind::Mul, &[x, two], tensor_ty(&[1024]), "scaled");
    let shifted = g.node(OpKind::Add, &[scaled, three], tensor_ty(&[1024]), "shifted");
    g.output(shifted);
    let kernel = compile(g.build());

    let input: Vec<f32> = (0..1024).map(|i| i as f32).collect();
    let expected: Vec<f32> = input.iter().map(|x| x * 2.0 + 3.0).collect();
    let out = run_one(
        &kernel,
        vec![StackValue::Tensor(
            Tensor::from_f32(input, &[1024], Device::Cpu).unwrap(),
        )],
    );
    assert_close(out.as_f32().unwrap(), &expected, 1e-6);
}

#[test]
fn running_twice_is_bitwise_equal() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[32], DType::F32, Device::Cpu);
    let y = g.node(OpKind::Sigmoid, &[x], tensor_ty(&[32]), "y");
    g.output(y);
    let kernel = compile(g.build());

    let input: Vec<f32> = (0..32).map(|i| (i as f32) * 0.25 - 4.0).collect();
    let t = Tensor::from_f32(input, &[32], Device::Cpu).unwrap();
    let first = run_one(&kernel, vec![StackValue::Tensor(t.clone())]);
    let second = run_one(&kernel, vec![StackValue::Tensor(t)]);
    assert_eq!(first.as_f32().unwrap(), second.as_f32().unwrap());
}

// Boundary shapes

#[test]
fn zero_dim_output_runs_without_loops() {
    let mut g = GraphBuilder::new();
    let a = g.tensor_input("a", &[], DType::F32, Device::Cpu);
    let b = g.tensor_input("b", &[], DType::F32, Device::Cpu);
    let sum = g.node(OpKind::Add, &[a, b], tensor_ty(&[]), "sum");
    g.output(sum);
    let kernel = compile(g.build());

    let a = Tensor::from_f32(vec![1.5], &[], Device::Cpu).unwrap();
    let b = Tensor::from_f32(vec![2.25], &[], Device::Cpu).unwrap();
    let out = run_one(
        &kernel,
        vec![StackValue::Tensor(a), StackValue::Tensor(b)],
    );
    assert_eq!(out.sizes(), &[] as &[i64]);
    assert_eq!(out.as_f32().unwrap(), &[3.75]);
}

#[test]
fn empty_tensor_inputs_produce_empty_outputs() {
    let mut g = GraphBuilder::new();
    let a = g.tensor_input("a", &[0, 4], DType::F32, Device::Cpu);
    let b = g.tensor_input("b", &[0, 4], DType::F32, Device::Cpu);
    let sum = g.node(OpKind::Add, &[a, b], tensor_ty(&[0, 4]), "sum");
    g.output(sum);
    let kernel = compile(g.build());

    let a = Tensor::zeros(&[0, 4], DType::F32, Device::Cpu);
    let b = Tensor::zeros(&[0, 4], DType::F32, Device::Cpu);
    let out = run_one(
        &kernel,
        vec![StackValue::Tensor(a), StackValue::Tensor(b)],
    );
    assert_eq!(out.sizes(), &[0, 4]);
    assert_eq!(out.numel(), 0);
}

// Argument ordering

#[test]
fn buffer_args_order_inputs_outputs_constants() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[4], DType::F32, Device::Cpu);
    let s = g.float_input("s");
    let c = g.constant(
        "c",
        ConstantValue::Tensor(Tensor::full_f32(&[4], 2.0, Device::Cpu)),
    );
    let scaled = g.node(OpKind::Mul, &[x, s], tensor_ty(&[4]), "scaled");
    let shifted = g.node(OpKind::Add, &[scaled, c], tensor_ty(&[4]), "shifted");
    g.output(shifted);
    let kernel = compile(g.build());

    let names: Vec<String> = kernel
        .buffer_args()
        .iter()
        .map(|a| a.name().to_string())
        .collect();
    // Inputs in graph order, then the output, then the constant.
    assert_eq!(names, vec!["tx", "vs", "aten_add", "const_c"]);

    let out = run_one(
        &kernel,
        vec![
            StackValue::Tensor(Tensor::full_f32(&[4], 3.0, Device::Cpu)),
            StackValue::Double(10.0),
        ],
    );
    assert_eq!(out.as_f32().unwrap(), &[32.0, 32.0, 32.0, 32.0]);
}

// Non-contiguous inputs and constants

#[test]
fn non_contiguous_input_is_normalized() {
    // A transposed [3, 2] view over row-major [2, 3] storage.
    let data = TensorData::F32(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    let transposed = Tensor::from_parts(data, &[3, 2], &[1, 3], Device::Cpu).unwrap();

    let mut g = GraphBuilder::new();
    let x = g.strided_tensor_input("x", &[3, 2], &[1, 3], DType::F32, Device::Cpu);
    let two = g.constant("two", ConstantValue::Int(2));
    let doubled = g.node(OpKind::Mul, &[x, two], tensor_ty(&[3, 2]), "doubled");
    g.output(doubled);
    let kernel = compile(g.build());

    let out = run_one(&kernel, vec![StackValue::Tensor(transposed)]);
    // Logical order of the transposed view is [0, 3, 1, 4, 2, 5].
    assert_eq!(out.as_f32().unwrap(), &[0.0, 6.0, 2.0, 8.0, 4.0, 10.0]);
}

#[test]
fn non_contiguous_constant_is_cloned_contiguous() {
    let data = TensorData::F32(vec![1.0, 10.0, 2.0, 20.0]);
    let strided = Tensor::from_parts(data, &[2, 2], &[1, 2], Device::Cpu).unwrap();
    assert!(!strided.is_contiguous());

    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[2, 2], DType::F32, Device::Cpu);
    let c = g.constant("c", ConstantValue::Tensor(strided));
    let sum = g.node(OpKind::Add, &[x, c], tensor_ty(&[2, 2]), "sum");
    g.output(sum);
    let kernel = compile(g.build());

    let out = run_one(
        &kernel,
        vec![StackValue::Tensor(Tensor::zeros(&[2, 2], DType::F32, Device::Cpu))],
    );
    // Logical order of the strided constant is [1, 2, 10, 20].
    assert_eq!(out.as_f32().unwrap(), &[1.0, 2.0, 10.0, 20.0]);
}

// Output restriding

#[test]
fn strided_output_permutes_element_positions() {
    // Declared output strides [1, 2] over sizes [2, 3]: column-major.
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[2, 3], DType::F32, Device::Cpu);
    let out_ty = ValueType::Tensor(TensorType::complete_strided(
        vec![2, 3],
        vec![1, 2],
        DType::F32,
        Device::Cpu,
    ));
    let y = g.node(OpKind::Relu, &[x], out_ty, "y");
    g.output(y);
    let kernel = compile(g.build());

    let input = Tensor::from_f32(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &[2, 3], Device::Cpu).unwrap();
    let out = run_one(&kernel, vec![StackValue::Tensor(input)]);
    assert_eq!(out.strides(), &[1, 2]);
    // Reading the strided result at logical (i, j) must equal the
    // contiguous value i*3 + j.
    let raw = out.as_f32().unwrap();
    for i in 0..2i64 {
        for j in 0..3i64 {
            let strided_pos = (i * 1 + j * 2) as usize;
            assert_eq!(raw[strided_pos], (i * 3 + j) as f32);
        }
    }
}

// Reductions, casts, chunking

#[test]
fn sum_reduces_to_scalar() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[8], DType::F32, Device::Cpu);
    let total = g.node(OpKind::Sum, &[x], tensor_ty(&[]), "total");
    g.output(total);
    let kernel = compile(g.build());

    let input: Vec<f32> = (1..=8).map(|i| i as f32).collect();
    let out = run_one(
        &kernel,
        vec![StackValue::Tensor(
            Tensor::from_f32(input, &[8], Device::Cpu).unwrap(),
        )],
    );
    assert_eq!(out.as_f32().unwrap(), &[36.0]);
}

#[test]
fn to_casts_float_to_long() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[4], DType::F32, Device::Cpu);
    let ty = ValueType::Tensor(TensorType::complete(vec![4], DType::I64, Device::Cpu));
    let y = g.node(OpKind::To, &[x], ty, "y");
    g.output(y);
    let kernel = compile(g.build());

    let input = Tensor::from_f32(vec![1.9, -2.9, 3.1, 0.0], &[4], Device::Cpu).unwrap();
    let out = run_one(&kernel, vec![StackValue::Tensor(input)]);
    assert_eq!(out.dtype(), DType::I64);
    assert_eq!(out.as_i64().unwrap(), &[1, -2, 3, 0]);
}

#[test]
fn constant_chunk_splits_along_dim() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[4, 2], DType::F32, Device::Cpu);
    let outs = g.node_multi(
        OpKind::ConstantChunk { dim: 0, chunks: 2 },
        &[x],
        vec![
            ("lo".to_string(), tensor_ty(&[2, 2])),
            ("hi".to_string(), tensor_ty(&[2, 2])),
        ],
    );
    g.output(outs[0]);
    g.output(outs[1]);
    let kernel = compile(g.build());

    let input: Vec<f32> = (0..8).map(|i| i as f32).collect();
    let mut stack: Stack = vec![StackValue::Tensor(
        Tensor::from_f32(input, &[4, 2], Device::Cpu).unwrap(),
    )];
    kernel.run(&mut stack).unwrap();
    assert_eq!(stack.len(), 2);
    let hi = stack.pop().unwrap();
    let lo = stack.pop().unwrap();
    assert_eq!(lo.as_tensor().unwrap().as_f32().unwrap(), &[0.0, 1.0, 2.0, 3.0]);
    assert_eq!(hi.as_tensor().unwrap().as_f32().unwrap(), &[4.0, 5.0, 6.0, 7.0]);
}

#[test]
fn quantize_unboxes_zero_dim_constant_scale() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[4], DType::F32, Device::Cpu);
    let scale = g.constant(
        "scale",
        ConstantValue::Tensor(Tensor::from_f32(vec![0.5], &[], Device::Cpu).unwrap()),
    );
    let zp = g.constant("zp", ConstantValue::Int(10));
    let dt = g.constant("dt", ConstantValue::Int(0));
    let ty = ValueType::Tensor(TensorType::complete(vec![4], DType::U8, Device::Cpu));
    let q = g.node(OpKind::QuantizePerTensor, &[x, scale, zp, dt], ty, "q");
    g.output(q);
    let kernel = compile(g.build());

    let input = Tensor::from_f32(vec![0.0, 0.5, 1.0, 2.0], &[4], Device::Cpu).unwrap();
    let out = run_one(&kernel, vec![StackValue::Tensor(input)]);
    assert_eq!(out.dtype(), DType::U8);
    // round(x / 0.5) + 10
    assert_eq!(out.as_u8().unwrap(), &[10, 11, 12, 14]);
}

// Concat and conditionals

fn cat_graph() -> vole_ir::Graph {
    let mut g = GraphBuilder::new();
    let a = g.tensor_input("a", &[4], DType::F32, Device::Cpu);
    let b = g.tensor_input("b", &[4], DType::F32, Device::Cpu);
    let list = g.list("list", &[a, b]);
    let dim = g.constant("dim", ConstantValue::Int(0));
    let y = g.node(OpKind::Cat, &[list, dim], tensor_ty(&[8]), "y");
    g.output(y);
    g.build()
}

fn run_cat(config: CompileConfig) -> Vec<f32> {
    let kernel = Kernel::new(
        cat_graph(),
        "fused_cat",
        LoweringRegistry::new(),
        vec![],
        false,
        config,
    )
    .expect("cat kernel compilation failed");
    let a = Tensor::from_f32(vec![1.0, 2.0, 3.0, 4.0], &[4], Device::Cpu).unwrap();
    let b = Tensor::from_f32(vec![5.0, 6.0, 7.0, 8.0], &[4], Device::Cpu).unwrap();
    let out = run_one(
        &kernel,
        vec![StackValue::Tensor(a), StackValue::Tensor(b)],
    );
    out.as_f32().unwrap().to_vec()
}

#[test]
fn cat_forms_agree() {
    let expected = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
    // Conditional-free form (default).
    assert_eq!(run_cat(CompileConfig::default()), expected);
    // Conditional form.
    assert_eq!(
        run_cat(CompileConfig::default().with_cat_without_conditionals(false)),
        expected
    );
    // Conditional form with the conditional-splitting pass enabled.
    assert_eq!(
        run_cat(
            CompileConfig::default()
                .with_cat_without_conditionals(false)
                .with_optimize_conditionals(true)
        ),
        expected
    );
}

// Conv2d

#[test]
fn conv2d_with_missing_bias_matches_fallback() {
    fn conv_graph(bias_none: bool) -> vole_ir::Graph {
        let mut g = GraphBuilder::new();
        let x = g.tensor_input("x", &[1, 2, 4, 4], DType::F32, Device::Cpu);
        let weight: Vec<f32> = (0..2 * 2 * 3 * 3).map(|i| (i % 5) as f32 * 0.5).collect();
        let w = g.constant(
            "w",
            ConstantValue::Tensor(
                Tensor::from_f32(weight, &[2, 2, 3, 3], Device::Cpu).unwrap(),
            ),
        );
        let bias = if bias_none {
            g.constant("bias", ConstantValue::None)
        } else {
            g.constant(
                "bias",
                ConstantValue::Tensor(Tensor::zeros(&[2], DType::F32, Device::Cpu)),
            )
        };
        let stride = g.constant("stride", ConstantValue::IntList(vec![1, 1]));
        let pad = g.constant("pad", ConstantValue::IntList(vec![0, 0]));
        let dilation = g.constant("dilation", ConstantValue::IntList(vec![1, 1]));
        let groups = g.constant("groups", ConstantValue::Int(1));
        let y = g.node(
            OpKind::Conv2d,
            &[x, w, bias, stride, pad, dilation, groups],
            tensor_ty(&[1, 2, 2, 2]),
            "y",
        );
        g.output(y);
        g.build()
    }

    let input: Vec<f32> = (0..32).map(|i| (i as f32) * 0.25).collect();
    let x = Tensor::from_f32(input, &[1, 2, 4, 4], Device::Cpu).unwrap();

    // Compiled with synthesized zero bias.
    let kernel = compile(conv_graph(true));
    let compiled = run_one(&kernel, vec![StackValue::Tensor(x.clone())]);

    // Fallback interpreter with an explicit zero bias.
    let mut stack: Stack = vec![StackValue::Tensor(x)];
    vole::interpret_graph(&conv_graph(false), &mut stack).unwrap();
    let reference = match stack.pop() {
        Some(StackValue::Tensor(t)) => t,
        other => panic!("expected tensor, got {:?}", other),
    };

    assert_eq!(compiled.sizes(), &[1, 2, 2, 2]);
    assert_close(
        compiled.as_f32().unwrap(),
        reference.as_f32().unwrap(),
        1e-4,
    );
}

// Symbolic shapes

#[test]
fn symbolic_shape_kernel_resizes_per_call() {
    let mut g = GraphBuilder::new();
    let x = g.symbolic_tensor_input(
        "x",
        vec![ShapeSym::Dynamic(-1), ShapeSym::Static(4)],
        DType::F32,
        Device::Cpu,
    );
    let n = g.int_input("n");
    let two = g.constant("two", ConstantValue::Int(2));
    let ty = ValueType::Tensor(TensorType::symbolic(
        vec![ShapeSym::Dynamic(-1), ShapeSym::Static(4)],
        DType::F32,
        Device::Cpu,
    ));
    let y = g.node(OpKind::Mul, &[x, two], ty, "y");
    g.output(y);
    let _ = n;

    let kernel = Kernel::new(
        g.build(),
        "fused_symbolic",
        LoweringRegistry::new(),
        vec![-1],
        false,
        CompileConfig::default(),
    )
    .expect("symbolic kernel compilation failed");

    for n_val in [3i64, 5] {
        let numel = (n_val * 4) as usize;
        let input: Vec<f32> = (0..numel).map(|i| i as f32).collect();
        let expected: Vec<f32> = input.iter().map(|x| x * 2.0).collect();
        let mut stack: Stack = vec![
            StackValue::Tensor(Tensor::from_f32(input, &[n_val, 4], Device::Cpu).unwrap()),
            StackValue::Int(n_val),
        ];
        kernel.run(&mut stack).unwrap();
        let out = match stack.pop() {
            Some(StackValue::Tensor(t)) => t,
            other => panic!("expected tensor, got {:?}", other),
        };
        assert_eq!(out.sizes(), &[n_val, 4]);
        assert_eq!(out.strides(), contiguous_strides(&[n_val, 4]).as_slice());
        assert_close(out.as_f32().unwrap(), &expected, 1e-6);
    }
}

// Random

#[test]
fn rand_like_produces_unit_interval_values() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[64], DType::F32, Device::Cpu);
    let y = g.node(OpKind::RandLike, &[x], tensor_ty(&[64]), "y");
    g.output(y);
    let kernel = compile(g.build());

    let out = run_one(
        &kernel,
        vec![StackValue::Tensor(Tensor::zeros(&[64], DType::F32, Device::Cpu))],
    );
    for &v in out.as_f32().unwrap() {
        assert!((0.0..=1.0).contains(&v), "rand value {} out of range", v);
    }
}

#[test]
fn random_with_broadcast_is_rejected() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[4, 4], DType::F32, Device::Cpu);
    let row = g.tensor_input("row", &[1, 4], DType::F32, Device::Cpu);
    let noise = g.node(OpKind::RandLike, &[x], tensor_ty(&[4, 4]), "noise");
    let spread = g.node(OpKind::Add, &[row, noise], tensor_ty(&[4, 4]), "spread");
    g.output(spread);

    let err = Kernel::new(
        g.build(),
        "fused_rand_broadcast",
        LoweringRegistry::new(),
        vec![],
        false,
        CompileConfig::default(),
    )
    .err()
    .expect("random + broadcast must not compile");
    assert!(matches!(err, Error::Constraint(_)), "got {:?}", err);
}

// Fallback

#[test]
fn unsupported_schema_fails_without_fallback() {
    let mut g = GraphBuilder::new();
    let a = g.tensor_input("a", &[2, 2], DType::F32, Device::Cpu);
    let b = g.tensor_input("b", &[2, 2], DType::F32, Device::Cpu);
    let y = g.node(OpKind::Matmul, &[a, b], tensor_ty(&[2, 2]), "y");
    g.output(y);

    let err = Kernel::new(
        g.build(),
        "fused_matmul",
        LoweringRegistry::new(),
        vec![],
        false,
        CompileConfig::default(),
    )
    .err()
    .expect("matmul has no standard lowering");
    assert!(matches!(err, Error::UnsupportedSchema { .. }), "got {:?}", err);
}

#[test]
fn fallback_and_compiled_paths_agree() {
    let build = || {
        let mut g = GraphBuilder::new();
        let a = g.tensor_input("a", &[8], DType::F32, Device::Cpu);
        let b = g.tensor_input("b", &[8], DType::F32, Device::Cpu);
        let y = g.node(OpKind::Add, &[a, b], tensor_ty(&[8]), "y");
        g.output(y);
        g.build()
    };
    let compiled = compile(build());
    assert!(!compiled.uses_fallback());

    let a: Vec<f32> = (0..8).map(|i| i as f32).collect();
    let b: Vec<f32> = (0..8).map(|i| (i * 10) as f32).collect();
    let ta = Tensor::from_f32(a, &[8], Device::Cpu).unwrap();
    let tb = Tensor::from_f32(b, &[8], Device::Cpu).unwrap();

    let fast = run_one(
        &compiled,
        vec![StackValue::Tensor(ta.clone()), StackValue::Tensor(tb.clone())],
    );

    let mut stack: Stack = vec![StackValue::Tensor(ta), StackValue::Tensor(tb)];
    vole::interpret_graph(&build(), &mut stack).unwrap();
    let slow = match stack.pop() {
        Some(StackValue::Tensor(t)) => t,
        other => panic!("expected tensor, got {:?}", other),
    };
    assert_eq!(fast.as_f32().unwrap(), slow.as_f32().unwrap());
}

#[test]
fn fallback_allowed_recovers_from_unlowerable_graphs() {
    let mut g = GraphBuilder::new();
    let a = g.tensor_input("a", &[2, 2], DType::F32, Device::Cpu);
    let b = g.tensor_input("b", &[2, 2], DType::F32, Device::Cpu);
    // No standard lowering exists for matmul, so compilation fails and the
    // kernel must divert to the interpreter.
    let y = g.node(OpKind::Matmul, &[a, b], tensor_ty(&[2, 2]), "y");
    g.output(y);

    let kernel = Kernel::new(
        g.build(),
        "fused_fallback",
        LoweringRegistry::new(),
        vec![],
        false,
        CompileConfig::default().with_fallback_allowed(true),
    )
    .expect("fallback-allowed construction must succeed");
    assert!(kernel.uses_fallback());

    // [[1, 1], [1, 1]] @ [[2, 2], [2, 2]] = [[4, 4], [4, 4]]
    let out = run_one(
        &kernel,
        vec![
            StackValue::Tensor(Tensor::full_f32(&[2, 2], 1.0, Device::Cpu)),
            StackValue::Tensor(Tensor::full_f32(&[2, 2], 2.0, Device::Cpu)),
        ],
    );
    assert_eq!(out.as_f32().unwrap(), &[4.0, 4.0, 4.0, 4.0]);
}

// Pre-allocation and recompilation

#[test]
fn pre_alloc_kernels_match_default_path() {
    // The reduction buffer is written twice (init + accumulate), so the
    // inliner leaves it as an intermediate the pre-alloc pass can claim.
    let build = || {
        let mut g = GraphBuilder::new();
        let x = g.tensor_input("x", &[16], DType::F32, Device::Cpu);
        let total = g.node(OpKind::Sum, &[x], tensor_ty(&[]), "total");
        let y = g.node(OpKind::Relu, &[total], tensor_ty(&[]), "y");
        g.output(y);
        g.build()
    };
    let input: Vec<f32> = (0..16).map(|i| (i as f32) * 0.1).collect();
    let t = Tensor::from_f32(input, &[16], Device::Cpu).unwrap();

    let plain = compile(build());
    let prealloc = Kernel::new(
        build(),
        "fused_prealloc",
        LoweringRegistry::new(),
        vec![],
        true,
        CompileConfig::default(),
    )
    .expect("pre-alloc kernel compilation failed");

    let a = run_one(&plain, vec![StackValue::Tensor(t.clone())]);
    let b = run_one(&prealloc, vec![StackValue::Tensor(t)]);
    assert_close(a.as_f32().unwrap(), b.as_f32().unwrap(), 1e-5);
}

#[test]
fn recompile_rebuilds_codegen_only() {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", &[4], DType::F32, Device::Cpu);
    let y = g.node(OpKind::Relu, &[x], tensor_ty(&[4]), "y");
    g.output(y);
    let mut kernel = compile(g.build());
    kernel.recompile().unwrap();

    let input = Tensor::from_f32(vec![-1.0, 2.0, -3.0, 4.0], &[4], Device::Cpu).unwrap();
    let out = run_one(&kernel, vec![StackValue::Tensor(input)]);
    assert_eq!(out.as_f32().unwrap(), &[0.0, 2.0, 0.0, 4.0]);
}

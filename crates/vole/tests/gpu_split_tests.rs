// GPU Split Tests — CUDA and block backend loop mapping
//
// This binary registers interpreting stand-ins under the CUDA and block
// codegen names, so kernels compile end-to-end and the block/thread
// bindings can be inspected on the scheduled statement.

use vole::{register_codegen, CompileConfig, Kernel, LoweringRegistry, Stack, StackValue};
use vole_core::{DType, Device, Error, Result, Tensor};
use vole_expr::{BufferArg, CodeGen, For, SimpleIrEval, Stmt};
use vole_ir::{GraphBuilder, OpKind, TensorType, ValueType};

fn interpreting_stub(
    stmt: Stmt,
    args: Vec<BufferArg>,
    _device: Device,
    name: String,
) -> Result<Box<dyn CodeGen>> {
    Ok(Box::new(SimpleIrEval::new(stmt, args, name)))
}

fn with_gpu_codegens() {
    register_codegen("cuda_codegen", interpreting_stub);
    register_codegen("block_codegen", interpreting_stub);
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

fn relu_graph(sizes: &[i64], dtype: DType, device: Device) -> vole_ir::Graph {
    let mut g = GraphBuilder::new();
    let x = g.tensor_input("x", sizes, dtype, device);
    let ty = ValueType::Tensor(TensorType::complete(sizes.to_vec(), dtype, device));
    let y = g.node(OpKind::Relu, &[x], ty, "y");
    g.output(y);
    g.build()
}

fn compile(graph: vole_ir::Graph, config: CompileConfig) -> Kernel {
    with_gpu_codegens();
    Kernel::new(
        graph,
        "fused_gpu",
        LoweringRegistry::new(),
        vec![],
        false,
        config,
    )
    .expect("kernel compilation failed")
}

// CUDA mappings

#[test]
fn cuda_two_level_mapping_binds_block_and_thread() {
    let kernel = compile(
        relu_graph(&[16, 64], DType::F32, Device::Cuda(0)),
        CompileConfig::default(),
    );
    let mut loops = Vec::new();
    collect_loops(kernel.scheduled_stmt().unwrap(), &mut loops);
    assert_eq!(loops.len(), 2);
    // Flattened 16*64 = 1024, split by the default block size 512.
    assert_eq!(loops[0].options.gpu_block_index, Some(0));
    assert_eq!(loops[0].stop.as_long(), Some(2));
    assert_eq!(loops[1].options.gpu_thread_index, Some(0));
    assert_eq!(loops[1].stop.as_long(), Some(512));
}

#[test]
fn cuda_two_level_respects_block_size_override() {
    let kernel = compile(
        relu_graph(&[100], DType::F32, Device::Cuda(0)),
        CompileConfig::default().with_cuda_block_size(64),
    );
    let mut loops = Vec::new();
    collect_loops(kernel.scheduled_stmt().unwrap(), &mut loops);
    assert_eq!(loops.len(), 2);
    assert_eq!(loops[0].stop.as_long(), Some(2)); // ceil(100 / 64)
    assert_eq!(loops[1].stop.as_long(), Some(64));
    // The ragged tail is masked.
    assert!(matches!(&*loops[1].body, Stmt::Cond { .. }));
}

#[test]
fn cuda_three_level_mapping_binds_middle_and_inner() {
    let kernel = compile(
        relu_graph(&[4096], DType::F32, Device::Cuda(0)),
        CompileConfig::default()
            .with_cuda_loop_levels(3)
            .with_cuda_block_count(4)
            .with_cuda_block_size(8),
    );
    let mut loops = Vec::new();
    collect_loops(kernel.scheduled_stmt().unwrap(), &mut loops);
    assert_eq!(loops.len(), 3);
    // Outermost serial loop over grid-sized chunks of 4*8 = 32.
    assert!(!loops[0].options.is_gpu_bound());
    assert_eq!(loops[0].stop.as_long(), Some(128));
    assert_eq!(loops[1].options.gpu_block_index, Some(0));
    assert_eq!(loops[1].stop.as_long(), Some(4));
    assert_eq!(loops[2].options.gpu_thread_index, Some(0));
    assert_eq!(loops[2].stop.as_long(), Some(8));
}

#[test]
fn cuda_invalid_loop_levels_are_fatal() {
    for levels in [1i64, 4] {
        let err = Kernel::new(
            relu_graph(&[64], DType::F32, Device::Cuda(0)),
            "fused_bad_levels",
            LoweringRegistry::new(),
            vec![],
            false,
            CompileConfig::default().with_cuda_loop_levels(levels),
        )
        .err()
        .expect("loop levels other than 2 or 3 must fail");
        assert!(matches!(err, Error::Constraint(_)), "got {:?}", err);
    }
}

#[test]
fn cuda_kernel_still_computes_correctly() {
    let kernel = compile(
        relu_graph(&[16, 64], DType::F32, Device::Cuda(0)),
        CompileConfig::default(),
    );
    let input: Vec<f32> = (0..1024).map(|i| (i as f32) - 512.0).collect();
    let expected: Vec<f32> = input.iter().map(|x| x.max(0.0)).collect();
    let mut stack: Stack = vec![StackValue::Tensor(
        Tensor::from_f32(input, &[16, 64], Device::Cuda(0)).unwrap(),
    )];
    kernel.run(&mut stack).unwrap();
    let Some(StackValue::Tensor(out)) = stack.pop() else {
        panic!("expected a tensor output");
    };
    assert_eq!(out.as_f32().unwrap(), expected.as_slice());
}

// Block backend

fn block_loops(dtype: DType, extent: i64) -> Vec<For> {
    let kernel = compile(
        relu_graph(&[extent], dtype, Device::Cpu),
        CompileConfig::default().with_block_code(true),
    );
    let mut loops = Vec::new();
    collect_loops(kernel.scheduled_stmt().unwrap(), &mut loops);
    loops
}

#[test]
fn block_backend_uses_dtype_block_sizes() {
    // Byte tensors get a 32-wide block.
    let loops = block_loops(DType::U8, 64);
    assert_eq!(loops.len(), 2);
    assert_eq!(loops[0].options.gpu_block_index, Some(0));
    assert_eq!(loops[1].options.gpu_thread_index, Some(0));
    assert_eq!(loops[1].stop.as_long(), Some(32));

    // Half tensors get the 16-wide default.
    let loops = block_loops(DType::F16, 64);
    assert_eq!(loops[1].stop.as_long(), Some(16));

    // So does everything else.
    let loops = block_loops(DType::F32, 64);
    assert_eq!(loops[1].stop.as_long(), Some(16));
}

#[test]
fn block_backend_attaches_buffer_map() {
    let loops = block_loops(DType::F32, 64);
    let map = loops[0]
        .options
        .buffer_map
        .as_ref()
        .expect("block-bound loop must carry the buffer map");
    // The pre-inlining map knows both the input and the output extents.
    assert!(map.keys().any(|k| k.starts_with("t")));
    assert!(map.keys().any(|k| k.starts_with("aten_")));
}

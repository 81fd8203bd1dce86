//! # vole
//!
//! A tensor-expression fusing JIT compiler core. The [`Kernel`] ingests a
//! typed dataflow subgraph ([`vole_ir::Graph`]), lowers each operator to
//! the tensor-expression IR ([`vole_expr`]), transforms the resulting loop
//! nest for the selected backend, and hands the final statement tree plus
//! a buffer-argument vector to a code generator.
//!
//! The pipeline, leaves first:
//! - shape resolution (symbolic shape symbols → IR variables)
//! - input and constant binding
//! - per-node lowering dispatch ([`lowerings`])
//! - output restriding for non-default strides
//! - loop-nest transformation ([`schedule`] + `vole_expr::LoopNest`)
//! - backend selection ([`backend`]) and runtime invocation over an
//!   evaluation [`Stack`](stack::Stack)
//! - fallback to a graph interpreter ([`interpreter`]) when allowed
//!
//! ```no_run
//! use vole::{CompileConfig, Kernel, LoweringRegistry, Stack, StackValue};
//! use vole_core::{DType, Device, Tensor};
//! use vole_ir::{GraphBuilder, OpKind, TensorType, ValueType};
//!
//! let mut g = GraphBuilder::new();
//! let a = g.tensor_input("a", &[4, 4], DType::F32, Device::Cpu);
//! let b = g.tensor_input("b", &[4, 4], DType::F32, Device::Cpu);
//! let ty = ValueType::Tensor(TensorType::complete(vec![4, 4], DType::F32, Device::Cpu));
//! let sum = g.node(OpKind::Add, &[a, b], ty, "sum");
//! g.output(sum);
//!
//! let kernel = Kernel::new(
//!     g.build(),
//!     "fused_add",
//!     LoweringRegistry::new(),
//!     vec![],
//!     false,
//!     CompileConfig::default(),
//! )?;
//! let mut stack: Stack = vec![
//!     StackValue::Tensor(Tensor::full_f32(&[4, 4], 1.0, Device::Cpu)),
//!     StackValue::Tensor(Tensor::full_f32(&[4, 4], 1.0, Device::Cpu)),
//! ];
//! kernel.run(&mut stack)?;
//! # Ok::<(), vole_core::Error>(())
//! ```

pub mod backend;
pub mod config;
pub mod fusible;
pub mod interpreter;
pub mod kernel;
pub mod lowerings;
pub mod schedule;
pub mod stack;

pub use backend::{
    codegen_registered, create_codegen, infer_backend, llvm_available, register_codegen,
    BackendKind,
};
pub use config::{dont_use_llvm, fallback_allowed, fallback_enforced, CompileConfig};
pub use fusible::{conv2d_is_supported, matmul_is_supported, tensor_info, TensorInfo};
pub use interpreter::interpret_graph;
pub use kernel::{fuser_error_message, pick_device_type, CompileStats, Kernel};
pub use lowerings::{standard_lowerings, ArgValue, LoweringFn, LoweringRegistry};
pub use stack::{Stack, StackValue};

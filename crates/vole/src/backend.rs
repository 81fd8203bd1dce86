use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use vole_core::{Device, Error, Result};
use vole_expr::{BufferArg, CodeGen, SimpleIrEval, Stmt};

use crate::config::{dont_use_llvm, CompileConfig};

// Backend selection and the codegen registry
//
// The kernel picks a backend from the device type, the configuration, and
// what is registered in this process. Optimizing code generators (LLVM,
// CUDA, block) are external collaborators: they register a factory under
// their well-known name, and the kernel resolves them at compile time.
// The interpreter backend is built in and always available.

/// The backend families the transformer schedules for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Llvm,
    Cuda,
    Block,
    SimpleIrEval,
}

impl BackendKind {
    /// Registry name of the matching code generator.
    pub fn codegen_name(&self) -> &'static str {
        match self {
            BackendKind::Llvm => "llvm_codegen",
            BackendKind::Cuda => "cuda_codegen",
            BackendKind::Block => "block_codegen",
            BackendKind::SimpleIrEval => "simple_ir_eval",
        }
    }
}

/// Factory signature external code generators register.
pub type CodeGenFactory =
    fn(Stmt, Vec<BufferArg>, Device, String) -> Result<Box<dyn CodeGen>>;

fn registry() -> &'static Mutex<HashMap<&'static str, CodeGenFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, CodeGenFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register (or replace) a code generator factory under `name`.
pub fn register_codegen(name: &'static str, factory: CodeGenFactory) {
    registry().lock().unwrap().insert(name, factory);
}

pub fn codegen_registered(name: &str) -> bool {
    registry().lock().unwrap().contains_key(name)
}

/// Whether an LLVM code generator is present in this process.
pub fn llvm_available() -> bool {
    codegen_registered(BackendKind::Llvm.codegen_name())
}

/// Pick a backend for `device` under `config`.
pub fn infer_backend(device: Device, config: &CompileConfig) -> Result<BackendKind> {
    match device {
        Device::Cuda(_) => Ok(BackendKind::Cuda),
        Device::Cpu if config.generate_block_code => Ok(BackendKind::Block),
        Device::Cpu => {
            let backend = if llvm_available() && !dont_use_llvm() {
                BackendKind::Llvm
            } else {
                BackendKind::SimpleIrEval
            };
            if config.must_use_llvm_on_cpu && backend == BackendKind::SimpleIrEval {
                return Err(Error::BackendUnavailable(
                    "LLVM backend not found".to_string(),
                ));
            }
            Ok(backend)
        }
    }
}

/// Instantiate the code generator for `kind` over the final statement.
pub fn create_codegen(
    kind: BackendKind,
    stmt: Stmt,
    buffer_args: Vec<BufferArg>,
    device: Device,
    kernel_func_name: String,
) -> Result<Box<dyn CodeGen>> {
    if kind == BackendKind::SimpleIrEval {
        return Ok(Box::new(SimpleIrEval::new(
            stmt,
            buffer_args,
            kernel_func_name,
        )));
    }
    let factory = registry().lock().unwrap().get(kind.codegen_name()).copied();
    match factory {
        Some(factory) => factory(stmt, buffer_args, device, kernel_func_name),
        None => Err(Error::BackendUnavailable(format!(
            "no code generator registered under '{}'",
            kind.codegen_name()
        ))),
    }
}

use crate::expr::{Buf, Var};
use crate::stmt::Stmt;
use vole_core::Result;

// CodeGen — The backend boundary
//
// A code generator takes the final statement tree plus an ordered buffer
// argument list at construction, and is invoked with one call argument per
// buffer argument: raw data pointers for buffers, immediates for scalars.
// The optimizing generators (LLVM, CUDA, block) live outside this
// workspace; the interpreter in `eval` is the in-tree implementation.

/// One formal parameter of a generated kernel.
#[derive(Debug, Clone)]
pub enum BufferArg {
    /// A tensor-like region passed by base pointer.
    Buf(Buf),
    /// A scalar passed by value.
    Var(Var),
}

impl BufferArg {
    pub fn name(&self) -> &str {
        match self {
            BufferArg::Buf(b) => b.name(),
            BufferArg::Var(v) => v.name(),
        }
    }
}

/// One actual argument of a kernel call.
#[derive(Debug, Clone, Copy)]
pub enum CallArg {
    /// Base pointer of a tensor's storage. The kernel writes only through
    /// pointers belonging to output and intermediate buffers.
    Ptr(*mut u8),
    Long(i64),
    Double(f64),
    Bool(bool),
}

/// A compiled kernel ready to be invoked.
pub trait CodeGen {
    /// Execute with one argument per buffer argument, in order.
    fn call(&self, args: &[CallArg]) -> Result<()>;

    /// The statement tree this generator was built from.
    fn stmt(&self) -> &Stmt;

    /// The kernel's function name.
    fn name(&self) -> &str;
}

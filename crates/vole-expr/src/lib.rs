//! # vole-expr
//!
//! The tensor-expression IR of the vole fusing JIT, and the loop-nest
//! library that transforms it.
//!
//! The IR has two levels:
//! - [`Expr`] — scalar expressions: immediates, variables, loads, casts,
//!   arithmetic, compare-select, intrinsics
//! - [`Stmt`] — statements: stores, loops, blocks, conditionals, buffer
//!   allocation
//!
//! A [`ComputeTensor`] couples a [`Buf`] with the statement producing it.
//! [`LoopNest`] owns a statement tree and applies the transformations the
//! kernel schedules: simplification, inlining, conditional optimization,
//! flattening, splitting, vectorization markers, codegen preparation.
//!
//! [`SimpleIrEval`] is the in-tree interpreter backend implementing the
//! [`CodeGen`] trait; optimizing code generators (LLVM, CUDA, block) are
//! external collaborators behind the same trait.

pub mod codegen;
pub mod eval;
pub mod expr;
pub mod loopnest;
pub mod simplify;
pub mod stmt;
pub mod tensor;

pub use codegen::{BufferArg, CallArg, CodeGen};
pub use eval::SimpleIrEval;
pub use expr::{BinOp, Buf, CmpOp, Expr, ExprNode, IntrinsicOp, Var};
pub use loopnest::LoopNest;
pub use simplify::{simplify_expr, simplify_stmt};
pub use stmt::{For, LoopOptions, Stmt};
pub use tensor::{compute, reduce, ComputeTensor};

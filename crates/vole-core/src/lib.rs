//! # vole-core
//!
//! Shared primitives for the vole fusing JIT compiler.
//!
//! This crate provides:
//! - [`DType`] — element data types (F16, F32, F64, U8, I64, Bool)
//! - [`Device`] — compute device identity (CPU, CUDA ordinal)
//! - [`Shape`] helpers — contiguous strides, dense-non-overlapping check
//! - [`Tensor`] — a concrete dense tensor with strided allocation, the
//!   runtime-side currency of kernel inputs, outputs, and constants
//! - [`Error`] / [`Result`] — the single error type used across the fuser

pub mod device;
pub mod dtype;
pub mod error;
pub mod shape;
pub mod tensor;

pub use device::Device;
pub use dtype::DType;
pub use error::{Error, Result};
pub use shape::{contiguous_strides, dense_non_overlapping, numel};
pub use tensor::{Tensor, TensorData};

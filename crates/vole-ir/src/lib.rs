//! # vole-ir
//!
//! The typed dataflow graph the fusing JIT ingests.
//!
//! A [`Graph`] is a small SSA region: values carry types (tensor with
//! possibly-symbolic shape, scalar float/int/bool, list, none), nodes carry
//! an operator kind plus a schema string, and constants carry their payload
//! inline. The upstream graph optimizer produces these; the kernel only
//! consumes them.

pub mod builder;
pub mod graph;

pub use builder::GraphBuilder;
pub use graph::{
    ConstantValue, Graph, Node, NodeId, OpKind, ShapeSym, TensorType, Value, ValueId, ValueType,
};

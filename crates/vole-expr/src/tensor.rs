use vole_core::{DType, Result};

use crate::expr::{Buf, Expr, Var};
use crate::stmt::Stmt;

// ComputeTensor — A buffer plus the statement that fills it
//
// The currency of lowerings and bindings. Either side may be empty: a
// pass-through binding (contiguous input) has a buffer but no statement; a
// null result has neither.

/// A buffer together with the loop nest computing it.
#[derive(Debug, Clone, Default)]
pub struct ComputeTensor {
    pub buf: Option<Buf>,
    pub stmt: Option<Stmt>,
}

impl ComputeTensor {
    pub fn new(buf: Buf, stmt: Stmt) -> ComputeTensor {
        ComputeTensor {
            buf: Some(buf),
            stmt: Some(stmt),
        }
    }

    /// A binding with storage but no producing statement.
    pub fn buf_only(buf: Buf) -> ComputeTensor {
        ComputeTensor {
            buf: Some(buf),
            stmt: None,
        }
    }
}

/// Fresh loop index variables `<prefix>0..<prefix>n`, dtype i64.
fn axis_vars(prefix: &str, n: usize) -> Vec<Var> {
    (0..n)
        .map(|i| Var::new(format!("{}{}", prefix, i), DType::I64))
        .collect()
}

/// Wrap `body` in loops over `axes`, outermost first, each from 0 to the
/// matching dim.
fn loop_nest(axes: &[Var], dims: &[Expr], body: Stmt) -> Stmt {
    let mut stmt = body;
    for (var, dim) in axes.iter().zip(dims.iter()).rev() {
        stmt = Stmt::loop_(var.clone(), Expr::long(0), dim.clone(), stmt);
    }
    stmt
}

/// Build a pointwise compute tensor: a buffer of `dims` and a loop nest
/// storing `body(axes)` at every position. Zero-dim tensors get a bare
/// store with no surrounding loops.
///
/// The body value is cast to `dtype` when its own dtype differs.
pub fn compute(
    name: impl Into<String>,
    dims: &[Expr],
    dtype: DType,
    body: impl FnOnce(&[Expr]) -> Result<Expr>,
) -> Result<ComputeTensor> {
    let axes = axis_vars("i", dims.len());
    let axis_exprs: Vec<Expr> = axes.iter().map(Expr::var).collect();
    let buf = Buf::new(name, dims.to_vec(), dtype);
    let mut value = body(&axis_exprs)?;
    if value.dtype() != dtype {
        value = Expr::cast(dtype, value);
    }
    let store = Stmt::store(&buf, axis_exprs, value);
    Ok(ComputeTensor::new(buf, loop_nest(&axes, dims, store)))
}

/// Build a sum-reduction compute tensor.
///
/// The buffer has `dims`; for every output position the statement first
/// stores `init(axes)`, then accumulates `body(axes, reduce_axes)` over
/// the reduction extents. The result is a block of two nests
/// (initialization and accumulation), which horizontal fusion may later
/// merge.
pub fn reduce(
    name: impl Into<String>,
    dims: &[Expr],
    dtype: DType,
    reduce_dims: &[Expr],
    init: impl FnOnce(&[Expr]) -> Result<Expr>,
    body: impl FnOnce(&[Expr], &[Expr]) -> Result<Expr>,
) -> Result<ComputeTensor> {
    let axes = axis_vars("i", dims.len());
    let reduce_axes = axis_vars("r", reduce_dims.len());
    let axis_exprs: Vec<Expr> = axes.iter().map(Expr::var).collect();
    let reduce_exprs: Vec<Expr> = reduce_axes.iter().map(Expr::var).collect();
    let buf = Buf::new(name, dims.to_vec(), dtype);

    let mut init_value = init(&axis_exprs)?;
    if init_value.dtype() != dtype {
        init_value = Expr::cast(dtype, init_value);
    }
    let init_store = Stmt::store(&buf, axis_exprs.clone(), init_value);
    let init_nest = loop_nest(&axes, dims, init_store);

    let mut term = body(&axis_exprs, &reduce_exprs)?;
    if term.dtype() != dtype {
        term = Expr::cast(dtype, term);
    }
    let acc = Expr::load(&buf, axis_exprs.clone()) + term;
    let acc_store = Stmt::store(&buf, axis_exprs, acc);
    let inner = loop_nest(&reduce_axes, reduce_dims, acc_store);
    let acc_nest = loop_nest(&axes, dims, inner);

    Ok(ComputeTensor::new(buf, Stmt::block(vec![init_nest, acc_nest])))
}

use std::collections::HashMap;

use vole_core::{DType, Device, Error, Result};
use vole_expr::{
    compute, reduce, BinOp, Buf, CmpOp, ComputeTensor, Expr, IntrinsicOp, Stmt, Var,
};
use vole_ir::OpKind;

use crate::config::CompileConfig;

// Lowerings — Operator-specific emission of compute tensors
//
// A lowering maps one operator plus its converted arguments to a compute
// tensor (dims + indexing function). The kernel dispatches through two
// registries: a custom registry keyed by operator name, then this standard
// registry keyed by the operator's schema string.

/// Argument form handed to lowerings. A tagged union, because every
/// lowering pattern-matches on the tag.
#[derive(Debug, Clone)]
pub enum ArgValue {
    Buf(Buf),
    /// A scalar kernel argument (bound graph input).
    Var(Var),
    Int(i64),
    Double(f64),
    Bool(bool),
    IntList(Vec<i64>),
    DoubleList(Vec<f64>),
    BufList(Vec<Buf>),
    /// The none-sentinel for optional operands.
    None,
}

impl ArgValue {
    pub fn as_buf(&self) -> Option<&Buf> {
        match self {
            ArgValue::Buf(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ArgValue::None)
    }

    /// Scalar arguments as an expression; buffers and lists are rejected.
    pub fn scalar_expr(&self) -> Result<Expr> {
        match self {
            ArgValue::Int(v) => Ok(Expr::long(*v)),
            ArgValue::Double(v) => Ok(Expr::double(*v)),
            ArgValue::Bool(v) => Ok(Expr::bool_imm(*v)),
            ArgValue::Var(v) => Ok(Expr::var(v)),
            other => Err(Error::malformed(format!(
                "expected a scalar argument, got {:?}",
                other
            ))),
        }
    }

    /// An int-or-int-pair argument as `[i64; 2]` (conv parameters).
    pub fn as_int_pair(&self) -> Result<[i64; 2]> {
        match self {
            ArgValue::Int(v) => Ok([*v, *v]),
            ArgValue::IntList(l) if l.len() == 1 => Ok([l[0], l[0]]),
            ArgValue::IntList(l) if l.len() == 2 => Ok([l[0], l[1]]),
            other => Err(Error::malformed(format!(
                "expected an int or int pair, got {:?}",
                other
            ))),
        }
    }
}

/// The lowering signature: `(args, output_shape, output_dtype, device)`.
pub type LoweringFn =
    Box<dyn Fn(&[ArgValue], &[Expr], Option<DType>, Device) -> Result<ComputeTensor>>;

/// A name-keyed table of lowering functions. The kernel uses one instance
/// keyed by operator name (custom lowerings) and one keyed by schema
/// string (the standard library below).
#[derive(Default)]
pub struct LoweringRegistry {
    map: HashMap<String, LoweringFn>,
}

impl LoweringRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, f: LoweringFn) {
        self.map.insert(key.into(), f);
    }

    pub fn get(&self, key: &str) -> Option<&LoweringFn> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Tensor dtype a lowering produces when the graph omits one.
fn resolved_dtype(output_dtype: Option<DType>) -> DType {
    output_dtype.unwrap_or(DType::F32)
}

fn zero_expr(dtype: DType) -> Expr {
    match dtype {
        DType::F32 => Expr::float(0.0),
        DType::F64 => Expr::double(0.0),
        DType::I64 => Expr::long(0),
        DType::Bool => Expr::bool_imm(false),
        _ => Expr::cast(dtype, Expr::float(0.0)),
    }
}

/// Load `buf` at `axes`, right-aligned, broadcasting extent-1 dimensions.
fn broadcast_load(buf: &Buf, axes: &[Expr]) -> Result<Expr> {
    let rank = buf.rank();
    if rank > axes.len() {
        return Err(Error::malformed(format!(
            "buffer {} of rank {} used at rank {}",
            buf.name(),
            rank,
            axes.len()
        )));
    }
    let offset = axes.len() - rank;
    let indices = buf
        .dims()
        .iter()
        .enumerate()
        .map(|(j, d)| {
            if d.as_long() == Some(1) {
                Expr::long(0)
            } else {
                axes[offset + j].clone()
            }
        })
        .collect();
    Ok(Expr::load(buf, indices))
}

/// An operand in a pointwise body: buffer loads broadcast, scalars embed.
fn operand_expr(arg: &ArgValue, axes: &[Expr]) -> Result<Expr> {
    match arg {
        ArgValue::Buf(b) => broadcast_load(b, axes),
        other => other.scalar_expr(),
    }
}

fn lower_binary(op: BinOp, name: &'static str) -> LoweringFn {
    Box::new(move |args, shape, out_dtype, _device| {
        if args.len() < 2 {
            return Err(Error::malformed(format!("{} expects two arguments", name)));
        }
        let dtype = resolved_dtype(out_dtype);
        compute(name, shape, dtype, |axes| {
            Ok(Expr::binary(
                op,
                operand_expr(&args[0], axes)?,
                operand_expr(&args[1], axes)?,
            ))
        })
    })
}

enum UnaryBody {
    Intrinsic(IntrinsicOp),
    Neg,
    Relu,
}

fn lower_unary(body: UnaryBody, name: &'static str) -> LoweringFn {
    Box::new(move |args, shape, out_dtype, _device| {
        if args.is_empty() {
            return Err(Error::malformed(format!("{} expects one argument", name)));
        }
        let dtype = resolved_dtype(out_dtype);
        compute(name, shape, dtype, |axes| {
            let x = operand_expr(&args[0], axes)?;
            Ok(match &body {
                UnaryBody::Intrinsic(op) => Expr::intrinsic(*op, x),
                UnaryBody::Neg => zero_expr(dtype) - x,
                UnaryBody::Relu => Expr::max(x, zero_expr(dtype)),
            })
        })
    })
}

fn lower_to() -> LoweringFn {
    Box::new(|args, shape, out_dtype, _device| {
        if args.is_empty() {
            return Err(Error::malformed("to expects one argument"));
        }
        let dtype = resolved_dtype(out_dtype);
        // compute() inserts the cast when the loaded dtype differs.
        compute("aten_to", shape, dtype, |axes| operand_expr(&args[0], axes))
    })
}

fn lower_sum() -> LoweringFn {
    Box::new(|args, shape, out_dtype, _device| {
        let input = args
            .first()
            .and_then(|a| a.as_buf())
            .ok_or_else(|| Error::malformed("sum expects a tensor argument"))?;
        let dtype = resolved_dtype(out_dtype);
        let reduce_dims = input.dims().to_vec();
        reduce(
            "aten_sum",
            shape,
            dtype,
            &reduce_dims,
            |_axes| Ok(zero_expr(dtype)),
            |_axes, r| Ok(Expr::load(input, r.to_vec())),
        )
    })
}

fn lower_rand_like() -> LoweringFn {
    Box::new(|_args, shape, out_dtype, _device| {
        let dtype = resolved_dtype(out_dtype);
        compute("aten_rand_like", shape, dtype, |_axes| Ok(Expr::rand(dtype)))
    })
}

fn lower_quantize_per_tensor() -> LoweringFn {
    Box::new(|args, shape, out_dtype, _device| {
        if args.len() < 3 {
            return Err(Error::malformed(
                "quantize_per_tensor expects input, scale, and zero_point",
            ));
        }
        let dtype = resolved_dtype(out_dtype);
        compute("aten_quantize_per_tensor", shape, dtype, |axes| {
            let x = operand_expr(&args[0], axes)?;
            let scale = args[1].scalar_expr()?;
            let zero_point = args[2].scalar_expr()?;
            Ok(Expr::intrinsic(IntrinsicOp::Round, x / scale) + zero_point)
        })
    })
}

fn lower_chunk() -> LoweringFn {
    Box::new(|args, shape, out_dtype, _device| {
        if args.len() < 4 {
            return Err(Error::malformed(
                "constant_chunk expects input, offset, dim, and chunks",
            ));
        }
        let input = args[0]
            .as_buf()
            .ok_or_else(|| Error::malformed("constant_chunk input must be a tensor"))?;
        let offset = args[1]
            .as_int()
            .ok_or_else(|| Error::malformed("constant_chunk offset must be an int"))?;
        let dim = args[2]
            .as_int()
            .ok_or_else(|| Error::malformed("constant_chunk dim must be an int"))?
            as usize;
        let chunks = args[3]
            .as_int()
            .ok_or_else(|| Error::malformed("constant_chunk chunks must be an int"))?;
        if dim >= input.rank() {
            return Err(Error::malformed("constant_chunk dim out of range"));
        }
        let dtype = resolved_dtype(out_dtype);
        let chunk_size = input.dims()[dim].clone() / Expr::long(chunks);
        let start = Expr::long(offset) * chunk_size;
        compute("aten_chunk", shape, dtype, |axes| {
            let mut indices = axes.to_vec();
            indices[dim] = indices[dim].clone() + start;
            Ok(Expr::load(input, indices))
        })
    })
}

/// Constant concat extents of the inputs along `dim`, plus running
/// offsets.
fn cat_offsets(inputs: &[Buf], dim: usize) -> Result<Vec<i64>> {
    let mut offsets = Vec::with_capacity(inputs.len() + 1);
    let mut acc = 0i64;
    offsets.push(0);
    for b in inputs {
        if dim >= b.rank() {
            return Err(Error::malformed("cat dim out of range"));
        }
        let extent = b.dims()[dim].as_long().ok_or_else(|| {
            Error::malformed("cat requires constant extents along the concat dimension")
        })?;
        acc += extent;
        offsets.push(acc);
    }
    Ok(offsets)
}

fn lower_cat(without_conditionals: bool) -> LoweringFn {
    Box::new(move |args, shape, out_dtype, _device| {
        let inputs = match args.first() {
            Some(ArgValue::BufList(bufs)) if !bufs.is_empty() => bufs.clone(),
            Some(ArgValue::BufList(_)) => {
                return Err(Error::malformed("empty tensor list passed to cat"))
            }
            _ => return Err(Error::malformed("cat expects a tensor list")),
        };
        let dim = args
            .get(1)
            .and_then(|a| a.as_int())
            .ok_or_else(|| Error::malformed("cat expects an int dim"))?
            as usize;
        let dtype = resolved_dtype(out_dtype);
        let offsets = cat_offsets(&inputs, dim)?;

        if without_conditionals {
            // One copy nest per input, each writing its slice of the
            // output directly — no per-element selects to block
            // vectorization.
            let out = Buf::new("aten_cat", shape.to_vec(), dtype);
            let mut nests = Vec::with_capacity(inputs.len());
            for (k, input) in inputs.iter().enumerate() {
                let axes: Vec<Var> = (0..input.rank())
                    .map(|j| Var::new(format!("j{}", j), DType::I64))
                    .collect();
                let axis_exprs: Vec<Expr> = axes.iter().map(Expr::var).collect();
                let mut out_indices = axis_exprs.clone();
                out_indices[dim] = out_indices[dim].clone() + Expr::long(offsets[k]);
                let mut value = Expr::load(input, axis_exprs);
                if value.dtype() != dtype {
                    value = Expr::cast(dtype, value);
                }
                let mut nest = Stmt::store(&out, out_indices, value);
                for (var, extent) in axes.iter().zip(input.dims().iter()).rev() {
                    nest = Stmt::loop_(var.clone(), Expr::long(0), extent.clone(), nest);
                }
                nests.push(nest);
            }
            return Ok(ComputeTensor::new(out, Stmt::block(nests)));
        }

        compute("aten_cat", shape, dtype, |axes| {
            // Right-fold a select chain over the inputs: the last input is
            // the final else-branch.
            let load_k = |k: usize| -> Expr {
                let mut indices = axes.to_vec();
                indices[dim] = indices[dim].clone() - Expr::long(offsets[k]);
                Expr::load(&inputs[k], indices)
            };
            let mut value = load_k(inputs.len() - 1);
            for k in (0..inputs.len() - 1).rev() {
                value = Expr::compare_select(
                    CmpOp::Lt,
                    axes[dim].clone(),
                    Expr::long(offsets[k + 1]),
                    load_k(k),
                    value,
                );
            }
            Ok(value)
        })
    })
}

fn lower_conv2d() -> LoweringFn {
    Box::new(|args, shape, out_dtype, _device| {
        if args.len() < 7 {
            return Err(Error::malformed(
                "conv2d expects input, weight, bias, stride, padding, dilation, groups",
            ));
        }
        let input = args[0]
            .as_buf()
            .ok_or_else(|| Error::malformed("conv2d input must be a tensor"))?;
        let weight = args[1]
            .as_buf()
            .ok_or_else(|| Error::malformed("conv2d weight must be a tensor"))?;
        let bias = args[2]
            .as_buf()
            .ok_or_else(|| Error::malformed("conv2d bias must be a tensor"))?;
        let stride = args[3].as_int_pair()?;
        let pad = args[4].as_int_pair()?;
        let dilation = args[5].as_int_pair()?;
        let groups = args[6]
            .as_int()
            .ok_or_else(|| Error::malformed("conv2d groups must be an int"))?;
        if input.rank() != 4 || weight.rank() != 4 || shape.len() != 4 {
            return Err(Error::malformed("conv2d operates on 4-d tensors"));
        }
        let dtype = resolved_dtype(out_dtype);
        let (h, w) = (input.dims()[2].clone(), input.dims()[3].clone());
        let in_per_group = weight.dims()[1].clone();
        let out_per_group = shape[1].clone() / Expr::long(groups);
        let reduce_dims = vec![
            in_per_group.clone(),
            weight.dims()[2].clone(),
            weight.dims()[3].clone(),
        ];
        let padded = pad != [0, 0];
        reduce(
            "aten_conv2d",
            shape,
            dtype,
            &reduce_dims,
            |axes| Ok(Expr::load(bias, vec![axes[1].clone()])),
            |axes, r| {
                let (n, co, oh, ow) = (
                    axes[0].clone(),
                    axes[1].clone(),
                    axes[2].clone(),
                    axes[3].clone(),
                );
                let (ci, kh, kw) = (r[0].clone(), r[1].clone(), r[2].clone());
                let group = co.clone() / out_per_group.clone();
                let in_c = group * in_per_group.clone() + ci.clone();
                let ih = oh * Expr::long(stride[0]) - Expr::long(pad[0])
                    + kh.clone() * Expr::long(dilation[0]);
                let iw = ow * Expr::long(stride[1]) - Expr::long(pad[1])
                    + kw.clone() * Expr::long(dilation[1]);
                let value = Expr::load(input, vec![n, in_c, ih.clone(), iw.clone()])
                    * Expr::load(weight, vec![co, ci, kh, kw]);
                if !padded {
                    return Ok(value);
                }
                // Out-of-bounds taps read as zero.
                let zero = zero_expr(dtype);
                let guard_w = Expr::compare_select(
                    CmpOp::Lt,
                    iw.clone(),
                    w.clone(),
                    value,
                    zero.clone(),
                );
                let guard_w =
                    Expr::compare_select(CmpOp::Ge, iw, Expr::long(0), guard_w, zero.clone());
                let guard_h = Expr::compare_select(
                    CmpOp::Lt,
                    ih.clone(),
                    h.clone(),
                    guard_w,
                    zero.clone(),
                );
                Ok(Expr::compare_select(
                    CmpOp::Ge,
                    ih,
                    Expr::long(0),
                    guard_h,
                    zero,
                ))
            },
        )
    })
}

/// The standard lowering library, keyed by schema string.
pub fn standard_lowerings(config: &CompileConfig) -> LoweringRegistry {
    let mut reg = LoweringRegistry::new();
    let mut add = |kind: OpKind, f: LoweringFn| {
        if let Some(schema) = kind.schema() {
            reg.insert(schema, f);
        }
    };
    add(OpKind::Add, lower_binary(BinOp::Add, "aten_add"));
    add(OpKind::Sub, lower_binary(BinOp::Sub, "aten_sub"));
    add(OpKind::Mul, lower_binary(BinOp::Mul, "aten_mul"));
    add(OpKind::Div, lower_binary(BinOp::Div, "aten_div"));
    add(OpKind::Neg, lower_unary(UnaryBody::Neg, "aten_neg"));
    add(
        OpKind::Abs,
        lower_unary(UnaryBody::Intrinsic(IntrinsicOp::Abs), "aten_abs"),
    );
    add(
        OpKind::Exp,
        lower_unary(UnaryBody::Intrinsic(IntrinsicOp::Exp), "aten_exp"),
    );
    add(
        OpKind::Log,
        lower_unary(UnaryBody::Intrinsic(IntrinsicOp::Log), "aten_log"),
    );
    add(
        OpKind::Sqrt,
        lower_unary(UnaryBody::Intrinsic(IntrinsicOp::Sqrt), "aten_sqrt"),
    );
    add(OpKind::Relu, lower_unary(UnaryBody::Relu, "aten_relu"));
    add(
        OpKind::Sigmoid,
        lower_unary(UnaryBody::Intrinsic(IntrinsicOp::Sigmoid), "aten_sigmoid"),
    );
    add(
        OpKind::Tanh,
        lower_unary(UnaryBody::Intrinsic(IntrinsicOp::Tanh), "aten_tanh"),
    );
    add(OpKind::ConstantChunk { dim: 0, chunks: 0 }, lower_chunk());
    add(OpKind::To, lower_to());
    add(OpKind::Sum, lower_sum());
    add(OpKind::Conv2d, lower_conv2d());
    add(OpKind::QuantizePerTensor, lower_quantize_per_tensor());
    add(OpKind::Cat, lower_cat(config.cat_without_conditionals));
    add(OpKind::RandLike, lower_rand_like());
    reg
}

use std::collections::HashMap;

use half::f16;
use vole_core::{DType, Device, Error, Result, Tensor};

use crate::codegen::{BufferArg, CallArg, CodeGen};
use crate::expr::{BinOp, Buf, CmpOp, Expr, ExprNode, IntrinsicOp, Var};
use crate::stmt::Stmt;

// SimpleIrEval — Reference interpreter over the statement IR
//
// Executes the final statement tree directly: loops run sequentially,
// scheduling markers (parallel, vectorize, GPU bindings) are ignored, and
// buffer accesses go through the raw pointers supplied at call time. This
// is the CPU backend of last resort and the semantic baseline the
// optimizing backends are tested against.

/// A scalar runtime value.
#[derive(Debug, Clone, Copy)]
enum Imm {
    Long(i64),
    Double(f64),
    Float(f32),
    Half(f16),
    Byte(u8),
    Bool(bool),
}

impl Imm {
    fn to_f64(self) -> f64 {
        match self {
            Imm::Long(v) => v as f64,
            Imm::Double(v) => v,
            Imm::Float(v) => v as f64,
            Imm::Half(v) => v.to_f64(),
            Imm::Byte(v) => v as f64,
            Imm::Bool(v) => v as i64 as f64,
        }
    }

    fn to_i64(self) -> i64 {
        match self {
            Imm::Long(v) => v,
            Imm::Double(v) => v as i64,
            Imm::Float(v) => v as i64,
            Imm::Half(v) => v.to_f64() as i64,
            Imm::Byte(v) => v as i64,
            Imm::Bool(v) => v as i64,
        }
    }

    fn from_f64(dtype: DType, v: f64) -> Imm {
        match dtype {
            DType::F16 => Imm::Half(f16::from_f64(v)),
            DType::F32 => Imm::Float(v as f32),
            DType::F64 => Imm::Double(v),
            DType::U8 => Imm::Byte(v as i64 as u8),
            DType::I64 => Imm::Long(v as i64),
            DType::Bool => Imm::Bool(v != 0.0),
        }
    }

    fn from_i64(dtype: DType, v: i64) -> Imm {
        match dtype {
            DType::F16 => Imm::Half(f16::from_f64(v as f64)),
            DType::F32 => Imm::Float(v as f32),
            DType::F64 => Imm::Double(v as f64),
            DType::U8 => Imm::Byte(v as u8),
            DType::I64 => Imm::Long(v),
            DType::Bool => Imm::Bool(v != 0),
        }
    }
}

/// Read one element of dtyped storage.
///
/// Safety: `ptr` must point at storage of at least `idx + 1` elements of
/// `dtype`, which the kernel's argument marshalling guarantees.
unsafe fn read_elem(ptr: *const u8, dtype: DType, idx: usize) -> Imm {
    match dtype {
        DType::F16 => Imm::Half(*(ptr as *const f16).add(idx)),
        DType::F32 => Imm::Float(*(ptr as *const f32).add(idx)),
        DType::F64 => Imm::Double(*(ptr as *const f64).add(idx)),
        DType::U8 => Imm::Byte(*ptr.add(idx)),
        DType::I64 => Imm::Long(*(ptr as *const i64).add(idx)),
        DType::Bool => Imm::Bool(*ptr.add(idx) != 0),
    }
}

/// Write one element, converting `v` to the destination dtype.
unsafe fn write_elem(ptr: *mut u8, dtype: DType, idx: usize, v: Imm) {
    match dtype {
        DType::F16 => *(ptr as *mut f16).add(idx) = f16::from_f64(v.to_f64()),
        DType::F32 => *(ptr as *mut f32).add(idx) = v.to_f64() as f32,
        DType::F64 => *(ptr as *mut f64).add(idx) = v.to_f64(),
        DType::U8 => *ptr.add(idx) = v.to_i64() as u8,
        DType::I64 => *(ptr as *mut i64).add(idx) = v.to_i64(),
        DType::Bool => *ptr.add(idx) = (v.to_i64() != 0) as u8,
    }
}

struct Env {
    vars: HashMap<Var, Imm>,
    bufs: HashMap<Buf, *mut u8>,
    /// Storage for intermediates allocated by `Allocate` statements.
    owned: HashMap<Buf, Tensor>,
}

pub struct SimpleIrEval {
    stmt: Stmt,
    buffer_args: Vec<BufferArg>,
    func_name: String,
}

impl SimpleIrEval {
    pub fn new(stmt: Stmt, buffer_args: Vec<BufferArg>, func_name: impl Into<String>) -> Self {
        SimpleIrEval {
            stmt,
            buffer_args,
            func_name: func_name.into(),
        }
    }
}

impl CodeGen for SimpleIrEval {
    fn call(&self, args: &[CallArg]) -> Result<()> {
        if args.len() != self.buffer_args.len() {
            return Err(Error::internal(format!(
                "kernel {} expects {} arguments, got {}",
                self.func_name,
                self.buffer_args.len(),
                args.len()
            )));
        }
        let mut env = Env {
            vars: HashMap::new(),
            bufs: HashMap::new(),
            owned: HashMap::new(),
        };
        for (i, (formal, actual)) in self.buffer_args.iter().zip(args.iter()).enumerate() {
            match (formal, actual) {
                (BufferArg::Buf(b), CallArg::Ptr(p)) => {
                    env.bufs.insert(b.clone(), *p);
                }
                (BufferArg::Var(v), CallArg::Long(x)) => {
                    env.vars.insert(v.clone(), Imm::Long(*x));
                }
                (BufferArg::Var(v), CallArg::Double(x)) => {
                    env.vars.insert(v.clone(), Imm::Double(*x));
                }
                (BufferArg::Var(v), CallArg::Bool(x)) => {
                    env.vars.insert(v.clone(), Imm::Bool(*x));
                }
                _ => {
                    return Err(Error::internal(format!(
                        "argument kind mismatch at position {} of kernel {}",
                        i, self.func_name
                    )));
                }
            }
        }
        exec_stmt(&self.stmt, &mut env)
    }

    fn stmt(&self) -> &Stmt {
        &self.stmt
    }

    fn name(&self) -> &str {
        &self.func_name
    }
}

fn buf_ptr(env: &Env, buf: &Buf) -> Result<*mut u8> {
    env.bufs.get(buf).copied().ok_or_else(|| {
        Error::internal(format!("no storage bound for buffer {}", buf.name()))
    })
}

/// Element offset for a (possibly still multi-dimensional) access.
fn element_offset(buf: &Buf, indices: &[Expr], env: &Env) -> Result<usize> {
    if indices.is_empty() {
        return Ok(0);
    }
    if indices.len() == 1 {
        return Ok(eval_expr(&indices[0], env)?.to_i64() as usize);
    }
    let dims = buf.dims();
    let mut flat = 0i64;
    for (j, idx) in indices.iter().enumerate() {
        let mut stride = 1i64;
        for d in &dims[j + 1..] {
            stride *= eval_expr(d, env)?.to_i64();
        }
        flat += eval_expr(idx, env)?.to_i64() * stride;
    }
    Ok(flat as usize)
}

fn eval_expr(e: &Expr, env: &Env) -> Result<Imm> {
    match e.node() {
        ExprNode::LongImm(v) => Ok(Imm::Long(*v)),
        ExprNode::DoubleImm(v) => Ok(Imm::Double(*v)),
        ExprNode::FloatImm(v) => Ok(Imm::Float(*v)),
        ExprNode::BoolImm(v) => Ok(Imm::Bool(*v)),
        ExprNode::Var(v) => env.vars.get(v).copied().ok_or_else(|| {
            Error::internal(format!("unbound variable {} during evaluation", v.name()))
        }),
        ExprNode::Cast { dtype, src } => {
            let v = eval_expr(src, env)?;
            if dtype.is_float() {
                Ok(Imm::from_f64(*dtype, v.to_f64()))
            } else {
                // Float-to-int casts truncate toward zero.
                Ok(Imm::from_i64(*dtype, v.to_i64()))
            }
        }
        ExprNode::Binary { op, lhs, rhs } => {
            let a = eval_expr(lhs, env)?;
            let b = eval_expr(rhs, env)?;
            let dtype = lhs.dtype().promote(rhs.dtype());
            match op {
                BinOp::And => return Ok(Imm::Bool(a.to_i64() != 0 && b.to_i64() != 0)),
                BinOp::Or => return Ok(Imm::Bool(a.to_i64() != 0 || b.to_i64() != 0)),
                _ => {}
            }
            if dtype.is_float() {
                let (x, y) = (a.to_f64(), b.to_f64());
                let v = match op {
                    BinOp::Add => x + y,
                    BinOp::Sub => x - y,
                    BinOp::Mul => x * y,
                    BinOp::Div => x / y,
                    BinOp::Mod => x % y,
                    BinOp::Max => x.max(y),
                    BinOp::Min => x.min(y),
                    BinOp::And | BinOp::Or => unreachable!(),
                };
                Ok(Imm::from_f64(dtype, v))
            } else {
                let (x, y) = (a.to_i64(), b.to_i64());
                let v = match op {
                    BinOp::Add => x + y,
                    BinOp::Sub => x - y,
                    BinOp::Mul => x * y,
                    BinOp::Div => {
                        if y == 0 {
                            return Err(Error::msg("integer division by zero in kernel"));
                        }
                        x / y
                    }
                    BinOp::Mod => {
                        if y == 0 {
                            return Err(Error::msg("integer modulo by zero in kernel"));
                        }
                        x % y
                    }
                    BinOp::Max => x.max(y),
                    BinOp::Min => x.min(y),
                    BinOp::And | BinOp::Or => unreachable!(),
                };
                Ok(Imm::from_i64(dtype, v))
            }
        }
        ExprNode::CompareSelect {
            op,
            lhs,
            rhs,
            if_true,
            if_false,
        } => {
            let a = eval_expr(lhs, env)?;
            let b = eval_expr(rhs, env)?;
            let cond = if lhs.dtype().promote(rhs.dtype()).is_float() {
                let (x, y) = (a.to_f64(), b.to_f64());
                match op {
                    CmpOp::Eq => x == y,
                    CmpOp::Ne => x != y,
                    CmpOp::Lt => x < y,
                    CmpOp::Le => x <= y,
                    CmpOp::Gt => x > y,
                    CmpOp::Ge => x >= y,
                }
            } else {
                let (x, y) = (a.to_i64(), b.to_i64());
                match op {
                    CmpOp::Eq => x == y,
                    CmpOp::Ne => x != y,
                    CmpOp::Lt => x < y,
                    CmpOp::Le => x <= y,
                    CmpOp::Gt => x > y,
                    CmpOp::Ge => x >= y,
                }
            };
            if cond {
                eval_expr(if_true, env)
            } else {
                eval_expr(if_false, env)
            }
        }
        ExprNode::Load { buf, indices } => {
            let ptr = buf_ptr(env, buf)?;
            let off = element_offset(buf, indices, env)?;
            Ok(unsafe { read_elem(ptr, buf.dtype(), off) })
        }
        ExprNode::Intrinsic { op, src } => {
            let x = eval_expr(src, env)?.to_f64();
            let v = match op {
                IntrinsicOp::Exp => x.exp(),
                IntrinsicOp::Log => x.ln(),
                IntrinsicOp::Sqrt => x.sqrt(),
                IntrinsicOp::Abs => x.abs(),
                IntrinsicOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
                IntrinsicOp::Tanh => x.tanh(),
                IntrinsicOp::Round => x.round(),
            };
            Ok(Imm::from_f64(src.dtype(), v))
        }
        ExprNode::Rand(dtype) => Ok(Imm::from_f64(*dtype, rand::random::<f64>())),
    }
}

fn exec_stmt(s: &Stmt, env: &mut Env) -> Result<()> {
    match s {
        Stmt::Store {
            buf,
            indices,
            value,
        } => {
            let ptr = buf_ptr(env, buf)?;
            let off = element_offset(buf, indices, env)?;
            let v = eval_expr(value, env)?;
            unsafe { write_elem(ptr, buf.dtype(), off, v) };
            Ok(())
        }
        Stmt::For(l) => {
            let start = eval_expr(&l.start, env)?.to_i64();
            let stop = eval_expr(&l.stop, env)?.to_i64();
            for i in start..stop {
                env.vars.insert(l.var.clone(), Imm::Long(i));
                exec_stmt(&l.body, env)?;
            }
            env.vars.remove(&l.var);
            Ok(())
        }
        Stmt::Block(stmts) => {
            for st in stmts {
                exec_stmt(st, env)?;
            }
            Ok(())
        }
        Stmt::Cond {
            condition,
            if_true,
            if_false,
        } => {
            if eval_expr(condition, env)?.to_i64() != 0 {
                exec_stmt(if_true, env)
            } else if let Some(e) = if_false {
                exec_stmt(e, env)
            } else {
                Ok(())
            }
        }
        Stmt::Allocate { buf } => {
            let mut n = 1i64;
            for d in buf.dims() {
                n *= eval_expr(d, env)?.to_i64();
            }
            let tensor = Tensor::zeros(&[n.max(0)], buf.dtype(), Device::Cpu);
            env.owned.insert(buf.clone(), tensor);
            if let Some(t) = env.owned.get_mut(buf) {
                let ptr = t.data_ptr_mut();
                env.bufs.insert(buf.clone(), ptr);
            }
            Ok(())
        }
        Stmt::FreeBuf { buf } => {
            // Only release storage this evaluation allocated; caller-owned
            // pointers stay bound.
            if env.owned.remove(buf).is_some() {
                env.bufs.remove(buf);
            }
            Ok(())
        }
        Stmt::Nop => Ok(()),
    }
}

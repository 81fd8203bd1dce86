use std::collections::HashMap;

use vole_core::DType;

use crate::expr::{rewrite_expr, BinOp, CmpOp, Expr, ExprNode};
use crate::stmt::{rewrite_stmt_exprs, For, Stmt};

// Simplifier — Constant folding and algebraic cleanup
//
// The simplifier is run between most transformation passes: after binding,
// after inlining (which creates long substituted chains), and once more
// before codegen. It folds immediates, removes arithmetic identities,
// collapses constant conditionals, and eliminates degenerate loops.
//
// Folding only produces immediates for dtypes that have an immediate form
// (i64, f64, f32, bool); f16 and u8 arithmetic is left for the backend.

fn fold_binary(op: BinOp, lhs: &Expr, rhs: &Expr) -> Option<Expr> {
    if !lhs.is_constant() || !rhs.is_constant() {
        return None;
    }
    let dtype = lhs.dtype().promote(rhs.dtype());
    match op {
        BinOp::And | BinOp::Or => {
            let a = lhs.as_long()? != 0;
            let b = rhs.as_long()? != 0;
            let v = if op == BinOp::And { a && b } else { a || b };
            return Some(Expr::bool_imm(v));
        }
        _ => {}
    }
    if dtype.is_float() {
        let a = lhs.as_double()?;
        let b = rhs.as_double()?;
        let v = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Mod => a % b,
            BinOp::Max => a.max(b),
            BinOp::Min => a.min(b),
            BinOp::And | BinOp::Or => unreachable!(),
        };
        match dtype {
            DType::F64 => Some(Expr::double(v)),
            DType::F32 => Some(Expr::float(v as f32)),
            _ => None,
        }
    } else {
        let a = lhs.as_long()?;
        let b = rhs.as_long()?;
        let v = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            // Division by a constant zero is a backend-time error, not a
            // compile-time one; leave it visible.
            BinOp::Div => {
                if b == 0 {
                    return None;
                }
                a / b
            }
            BinOp::Mod => {
                if b == 0 {
                    return None;
                }
                a % b
            }
            BinOp::Max => a.max(b),
            BinOp::Min => a.min(b),
            BinOp::And | BinOp::Or => unreachable!(),
        };
        match dtype {
            DType::I64 => Some(Expr::long(v)),
            DType::Bool => Some(Expr::bool_imm(v != 0)),
            _ => None,
        }
    }
}

fn is_zero(e: &Expr) -> bool {
    e.as_long() == Some(0) || e.as_double() == Some(0.0)
}

fn is_one(e: &Expr) -> bool {
    e.as_long() == Some(1) || e.as_double() == Some(1.0)
}

/// Zero immediate of the given dtype, when one exists.
fn zero_of(dtype: DType) -> Option<Expr> {
    match dtype {
        DType::I64 => Some(Expr::long(0)),
        DType::F64 => Some(Expr::double(0.0)),
        DType::F32 => Some(Expr::float(0.0)),
        DType::Bool => Some(Expr::bool_imm(false)),
        _ => None,
    }
}

/// Whether dropping `imm` from an identity like `x + imm` preserves the
/// expression's dtype.
fn identity_keeps_dtype(x: &Expr, imm: &Expr) -> bool {
    x.dtype().promote(imm.dtype()) == x.dtype()
}

fn simplify_node(e: &Expr) -> Option<Expr> {
    match e.node() {
        ExprNode::Binary { op, lhs, rhs } => {
            if let Some(folded) = fold_binary(*op, lhs, rhs) {
                return Some(folded);
            }
            match op {
                BinOp::Add => {
                    if is_zero(rhs) && identity_keeps_dtype(lhs, rhs) {
                        return Some(lhs.clone());
                    }
                    if is_zero(lhs) && identity_keeps_dtype(rhs, lhs) {
                        return Some(rhs.clone());
                    }
                }
                BinOp::Sub => {
                    if is_zero(rhs) && identity_keeps_dtype(lhs, rhs) {
                        return Some(lhs.clone());
                    }
                }
                BinOp::Mul => {
                    if is_one(rhs) && identity_keeps_dtype(lhs, rhs) {
                        return Some(lhs.clone());
                    }
                    if is_one(lhs) && identity_keeps_dtype(rhs, lhs) {
                        return Some(rhs.clone());
                    }
                    if is_zero(rhs) || is_zero(lhs) {
                        if let Some(z) = zero_of(e.dtype()) {
                            return Some(z);
                        }
                    }
                }
                BinOp::Div => {
                    if is_one(rhs) && identity_keeps_dtype(lhs, rhs) {
                        return Some(lhs.clone());
                    }
                }
                BinOp::Mod => {
                    if is_one(rhs) && e.dtype() == DType::I64 {
                        return Some(Expr::long(0));
                    }
                }
                _ => {}
            }
            None
        }
        ExprNode::Cast { dtype, src } => {
            if src.dtype() == *dtype {
                return Some(src.clone());
            }
            if src.is_constant() {
                return match dtype {
                    DType::I64 => src.as_double().map(|v| Expr::long(v as i64)),
                    DType::F64 => src.as_double().map(Expr::double),
                    DType::F32 => src.as_double().map(|v| Expr::float(v as f32)),
                    DType::Bool => src.as_double().map(|v| Expr::bool_imm(v != 0.0)),
                    _ => None,
                };
            }
            None
        }
        ExprNode::CompareSelect {
            op,
            lhs,
            rhs,
            if_true,
            if_false,
        } => {
            if lhs.is_constant() && rhs.is_constant() {
                let (a, b) = (lhs.as_double()?, rhs.as_double()?);
                let cond = match op {
                    CmpOp::Eq => a == b,
                    CmpOp::Ne => a != b,
                    CmpOp::Lt => a < b,
                    CmpOp::Le => a <= b,
                    CmpOp::Gt => a > b,
                    CmpOp::Ge => a >= b,
                };
                return Some(if cond { if_true.clone() } else { if_false.clone() });
            }
            None
        }
        _ => None,
    }
}

/// Simplify an expression tree to fixpoint-per-node (single post-order
/// sweep; children are already simplified when a parent is visited).
pub fn simplify_expr(e: &Expr) -> Expr {
    rewrite_expr(e, &mut simplify_node)
}

/// Loop trip count when both bounds are constant.
pub fn const_trip_count(l: &For) -> Option<i64> {
    let start = simplify_expr(&l.start).as_long()?;
    let stop = simplify_expr(&l.stop).as_long()?;
    Some(stop - start)
}

/// Simplify a statement tree: fold expressions, collapse constant
/// conditionals, drop empty and single-iteration loops, splice nested
/// blocks.
pub fn simplify_stmt(s: &Stmt) -> Stmt {
    let s = rewrite_stmt_exprs(s, &mut simplify_node);
    simplify_structure(s)
}

fn simplify_structure(s: Stmt) -> Stmt {
    match s {
        Stmt::For(mut l) => {
            *l.body = simplify_structure(std::mem::replace(&mut *l.body, Stmt::Nop));
            if l.body.is_nop() {
                return Stmt::Nop;
            }
            if let Some(trip) = const_trip_count(&l) {
                if trip <= 0 {
                    return Stmt::Nop;
                }
                if trip == 1 && !l.options.is_gpu_bound() {
                    // A single-iteration loop is just its body with the
                    // index pinned to the start bound.
                    let mut map = HashMap::new();
                    map.insert(l.var.clone(), l.start.clone());
                    let body = std::mem::replace(&mut *l.body, Stmt::Nop);
                    let pinned =
                        rewrite_stmt_exprs(&body, &mut |e| match e.node() {
                            ExprNode::Var(v) => map.get(v).cloned(),
                            _ => None,
                        });
                    return simplify_stmt(&pinned);
                }
            }
            Stmt::For(l)
        }
        Stmt::Block(stmts) => {
            let mut out: Vec<Stmt> = Vec::with_capacity(stmts.len());
            for st in stmts {
                match simplify_structure(st) {
                    Stmt::Nop => {}
                    Stmt::Block(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            if out.is_empty() {
                Stmt::Nop
            } else {
                Stmt::Block(out)
            }
        }
        Stmt::Cond {
            condition,
            if_true,
            if_false,
        } => {
            let cond = simplify_expr(&condition);
            if let Some(v) = cond.as_long() {
                return if v != 0 {
                    simplify_structure(*if_true)
                } else {
                    match if_false {
                        Some(e) => simplify_structure(*e),
                        None => Stmt::Nop,
                    }
                };
            }
            let if_true = Box::new(simplify_structure(*if_true));
            let if_false = if_false.map(|e| Box::new(simplify_structure(*e)));
            Stmt::Cond {
                condition: cond,
                if_true,
                if_false,
            }
        }
        other => other,
    }
}

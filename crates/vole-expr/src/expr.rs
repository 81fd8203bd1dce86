use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use vole_core::DType;

// Expr — Scalar expression trees
//
// Expressions are immutable trees of reference-counted nodes. Passes never
// mutate a node in place; they rebuild the spine and share unchanged
// subtrees, which makes cloning during transformation cheap.
//
// Variables and buffers have *identity* semantics: two `Var`s are the same
// variable only if they are the same allocation, regardless of name. Names
// exist for printing and for the generated code, not for resolution.

/// A named scalar variable (loop index, kernel scalar argument, shape
/// symbol). Identity is allocation identity, not name equality.
#[derive(Clone)]
pub struct Var(Rc<VarData>);

#[derive(Debug)]
pub struct VarData {
    pub name: String,
    pub dtype: DType,
}

impl Var {
    pub fn new(name: impl Into<String>, dtype: DType) -> Var {
        Var(Rc::new(VarData {
            name: name.into(),
            dtype,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Var {}

impl Hash for Var {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

/// A named, dtyped, ranked buffer. The dimension vector may contain
/// symbolic expressions. Identity is allocation identity.
#[derive(Clone)]
pub struct Buf(Rc<BufData>);

#[derive(Debug)]
pub struct BufData {
    pub name: String,
    pub dims: Vec<Expr>,
    pub dtype: DType,
}

impl Buf {
    pub fn new(name: impl Into<String>, dims: Vec<Expr>, dtype: DType) -> Buf {
        Buf(Rc::new(BufData {
            name: name.into(),
            dims,
            dtype,
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn dims(&self) -> &[Expr] {
        &self.0.dims
    }

    pub fn rank(&self) -> usize {
        self.0.dims.len()
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    /// Element count when every dimension is a constant.
    pub fn const_numel(&self) -> Option<i64> {
        let mut n = 1i64;
        for d in self.dims() {
            n *= d.as_long()?;
        }
        Some(n)
    }
}

impl PartialEq for Buf {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Buf {}

impl Hash for Buf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

/// Binary arithmetic and logical operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Max,
    Min,
    And,
    Or,
}

/// Comparison operators for compare-select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Unary math intrinsics lowered by backends to their native forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicOp {
    Exp,
    Log,
    Sqrt,
    Abs,
    Sigmoid,
    Tanh,
    Round,
}

/// One expression node. Build through the [`Expr`] constructors.
#[derive(Debug)]
pub enum ExprNode {
    LongImm(i64),
    DoubleImm(f64),
    FloatImm(f32),
    BoolImm(bool),
    Var(Var),
    Cast {
        dtype: DType,
        src: Expr,
    },
    Binary {
        op: BinOp,
        lhs: Expr,
        rhs: Expr,
    },
    /// `if lhs <op> rhs then if_true else if_false`.
    CompareSelect {
        op: CmpOp,
        lhs: Expr,
        rhs: Expr,
        if_true: Expr,
        if_false: Expr,
    },
    Load {
        buf: Buf,
        indices: Vec<Expr>,
    },
    Intrinsic {
        op: IntrinsicOp,
        src: Expr,
    },
    /// Uniform random value in [0, 1) of the given dtype, drawn at
    /// execution time.
    Rand(DType),
}

/// Shared-ownership handle to an expression tree.
#[derive(Clone)]
pub struct Expr(Rc<ExprNode>);

impl Expr {
    pub fn node(&self) -> &ExprNode {
        &self.0
    }

    pub fn long(v: i64) -> Expr {
        Expr(Rc::new(ExprNode::LongImm(v)))
    }

    pub fn double(v: f64) -> Expr {
        Expr(Rc::new(ExprNode::DoubleImm(v)))
    }

    pub fn float(v: f32) -> Expr {
        Expr(Rc::new(ExprNode::FloatImm(v)))
    }

    pub fn bool_imm(v: bool) -> Expr {
        Expr(Rc::new(ExprNode::BoolImm(v)))
    }

    pub fn var(v: &Var) -> Expr {
        Expr(Rc::new(ExprNode::Var(v.clone())))
    }

    pub fn cast(dtype: DType, src: Expr) -> Expr {
        Expr(Rc::new(ExprNode::Cast { dtype, src }))
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr(Rc::new(ExprNode::Binary { op, lhs, rhs }))
    }

    pub fn max(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Max, lhs, rhs)
    }

    pub fn min(lhs: Expr, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Min, lhs, rhs)
    }

    pub fn compare_select(op: CmpOp, lhs: Expr, rhs: Expr, if_true: Expr, if_false: Expr) -> Expr {
        Expr(Rc::new(ExprNode::CompareSelect {
            op,
            lhs,
            rhs,
            if_true,
            if_false,
        }))
    }

    pub fn load(buf: &Buf, indices: Vec<Expr>) -> Expr {
        Expr(Rc::new(ExprNode::Load {
            buf: buf.clone(),
            indices,
        }))
    }

    pub fn intrinsic(op: IntrinsicOp, src: Expr) -> Expr {
        Expr(Rc::new(ExprNode::Intrinsic { op, src }))
    }

    pub fn rand(dtype: DType) -> Expr {
        Expr(Rc::new(ExprNode::Rand(dtype)))
    }

    /// The dtype this expression evaluates to.
    pub fn dtype(&self) -> DType {
        match self.node() {
            ExprNode::LongImm(_) => DType::I64,
            ExprNode::DoubleImm(_) => DType::F64,
            ExprNode::FloatImm(_) => DType::F32,
            ExprNode::BoolImm(_) => DType::Bool,
            ExprNode::Var(v) => v.dtype(),
            ExprNode::Cast { dtype, .. } => *dtype,
            ExprNode::Binary { op, lhs, rhs } => match op {
                BinOp::And | BinOp::Or => DType::Bool,
                _ => lhs.dtype().promote(rhs.dtype()),
            },
            ExprNode::CompareSelect {
                if_true, if_false, ..
            } => if_true.dtype().promote(if_false.dtype()),
            ExprNode::Load { buf, .. } => buf.dtype(),
            ExprNode::Intrinsic { src, .. } => src.dtype(),
            ExprNode::Rand(dtype) => *dtype,
        }
    }

    /// Whether this node is an immediate.
    pub fn is_constant(&self) -> bool {
        matches!(
            self.node(),
            ExprNode::LongImm(_)
                | ExprNode::DoubleImm(_)
                | ExprNode::FloatImm(_)
                | ExprNode::BoolImm(_)
        )
    }

    /// Integral immediate value, if this is one.
    pub fn as_long(&self) -> Option<i64> {
        match self.node() {
            ExprNode::LongImm(v) => Some(*v),
            ExprNode::BoolImm(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Floating immediate value (also reads integral immediates).
    pub fn as_double(&self) -> Option<f64> {
        match self.node() {
            ExprNode::DoubleImm(v) => Some(*v),
            ExprNode::FloatImm(v) => Some(*v as f64),
            ExprNode::LongImm(v) => Some(*v as f64),
            ExprNode::BoolImm(v) => Some(*v as i64 as f64),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self.node() {
            ExprNode::Var(v) => Some(v),
            _ => None,
        }
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, self, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Div, self, rhs)
    }
}

impl std::ops::Rem for Expr {
    type Output = Expr;
    fn rem(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mod, self, rhs)
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            ExprNode::LongImm(v) => write!(f, "{}", v),
            ExprNode::DoubleImm(v) => write!(f, "{:?}", v),
            ExprNode::FloatImm(v) => write!(f, "{:?}f", v),
            ExprNode::BoolImm(v) => write!(f, "{}", v),
            ExprNode::Var(v) => write!(f, "{}", v.name()),
            ExprNode::Cast { dtype, src } => write!(f, "{}({})", dtype, src),
            ExprNode::Binary { op, lhs, rhs } => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::Mod => "%",
                    BinOp::Max => return write!(f, "max({}, {})", lhs, rhs),
                    BinOp::Min => return write!(f, "min({}, {})", lhs, rhs),
                    BinOp::And => "&&",
                    BinOp::Or => "||",
                };
                write!(f, "({} {} {})", lhs, sym, rhs)
            }
            ExprNode::CompareSelect {
                op,
                lhs,
                rhs,
                if_true,
                if_false,
            } => {
                let sym = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                write!(f, "({} {} {} ? {} : {})", lhs, sym, rhs, if_true, if_false)
            }
            ExprNode::Load { buf, indices } => {
                write!(f, "{}[", buf.name())?;
                for (i, idx) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", idx)?;
                }
                write!(f, "]")
            }
            ExprNode::Intrinsic { op, src } => write!(f, "{:?}({})", op, src),
            ExprNode::Rand(dtype) => write!(f, "rand<{}>()", dtype),
        }
    }
}

// Rewriting utilities
//
// All passes are expressed as post-order rewrites: children are rebuilt
// first, then the callback may replace the rebuilt node. Returning `None`
// keeps the node.

/// Post-order rewrite of an expression tree.
pub fn rewrite_expr(e: &Expr, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
    let rebuilt = match e.node() {
        ExprNode::Cast { dtype, src } => Expr::cast(*dtype, rewrite_expr(src, f)),
        ExprNode::Binary { op, lhs, rhs } => {
            Expr::binary(*op, rewrite_expr(lhs, f), rewrite_expr(rhs, f))
        }
        ExprNode::CompareSelect {
            op,
            lhs,
            rhs,
            if_true,
            if_false,
        } => Expr::compare_select(
            *op,
            rewrite_expr(lhs, f),
            rewrite_expr(rhs, f),
            rewrite_expr(if_true, f),
            rewrite_expr(if_false, f),
        ),
        ExprNode::Load { buf, indices } => Expr::load(
            buf,
            indices.iter().map(|i| rewrite_expr(i, f)).collect(),
        ),
        ExprNode::Intrinsic { op, src } => Expr::intrinsic(*op, rewrite_expr(src, f)),
        _ => e.clone(),
    };
    f(&rebuilt).unwrap_or(rebuilt)
}

/// Visit every node of an expression tree, children first.
pub fn visit_expr(e: &Expr, f: &mut dyn FnMut(&Expr)) {
    match e.node() {
        ExprNode::Cast { src, .. } => visit_expr(src, f),
        ExprNode::Binary { lhs, rhs, .. } => {
            visit_expr(lhs, f);
            visit_expr(rhs, f);
        }
        ExprNode::CompareSelect {
            lhs,
            rhs,
            if_true,
            if_false,
            ..
        } => {
            visit_expr(lhs, f);
            visit_expr(rhs, f);
            visit_expr(if_true, f);
            visit_expr(if_false, f);
        }
        ExprNode::Load { indices, .. } => {
            for i in indices {
                visit_expr(i, f);
            }
        }
        ExprNode::Intrinsic { src, .. } => visit_expr(src, f),
        _ => {}
    }
    f(e);
}

/// Substitute variables by expressions throughout a tree.
pub fn substitute(e: &Expr, map: &std::collections::HashMap<Var, Expr>) -> Expr {
    rewrite_expr(e, &mut |node| match node.node() {
        ExprNode::Var(v) => map.get(v).cloned(),
        _ => None,
    })
}

/// Whether the tree contains a `Rand` node (such values must not be
/// duplicated by inlining).
pub fn contains_rand(e: &Expr) -> bool {
    let mut found = false;
    visit_expr(e, &mut |n| {
        if matches!(n.node(), ExprNode::Rand(_)) {
            found = true;
        }
    });
    found
}

/// Whether the tree loads from `buf`.
pub fn loads_from(e: &Expr, buf: &Buf) -> bool {
    let mut found = false;
    visit_expr(e, &mut |n| {
        if let ExprNode::Load { buf: b, .. } = n.node() {
            if b == buf {
                found = true;
            }
        }
    });
    found
}

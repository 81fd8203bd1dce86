use std::collections::HashMap;
use std::fmt;

use crate::expr::{rewrite_expr, visit_expr, Buf, Expr, Var};

// Stmt — Statement trees
//
// A statement tree is what the kernel hands to a code generator: a block of
// loop nests storing into buffers. Unlike expressions, statements are plain
// owned values; passes consume or mutably borrow them and rebuild in place.

/// Scheduling annotations attached to a loop by the transformer. Code
/// generators interpret them; the interpreter backend ignores them and runs
/// sequentially.
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Outer-loop parallelism marker (CPU backends).
    pub parallel: bool,
    /// Inner-loop vectorization marker (CPU backends).
    pub vectorized: bool,
    /// GPU block (grid) axis this loop is bound to.
    pub gpu_block_index: Option<usize>,
    /// GPU thread axis this loop is bound to.
    pub gpu_thread_index: Option<usize>,
    /// Multi-dim buffer extents recorded before inlining, for the block
    /// backend.
    pub buffer_map: Option<HashMap<String, Vec<Expr>>>,
}

impl LoopOptions {
    pub fn is_gpu_bound(&self) -> bool {
        self.gpu_block_index.is_some() || self.gpu_thread_index.is_some()
    }
}

/// A `for var in start..stop` loop.
#[derive(Debug, Clone)]
pub struct For {
    pub var: Var,
    pub start: Expr,
    pub stop: Expr,
    pub body: Box<Stmt>,
    pub options: LoopOptions,
}

impl For {
    pub fn new(var: Var, start: Expr, stop: Expr, body: Stmt) -> For {
        For {
            var,
            start,
            stop,
            body: Box::new(body),
            options: LoopOptions::default(),
        }
    }

    /// The first loop directly inside this one, when the body is a loop or
    /// a block leading with one.
    pub fn first_inner_loop_mut(&mut self) -> Option<&mut For> {
        match self.body.as_mut() {
            Stmt::For(inner) => Some(inner),
            Stmt::Block(stmts) => stmts.iter_mut().find_map(|s| match s {
                Stmt::For(inner) => Some(inner.as_mut()),
                _ => None,
            }),
            _ => None,
        }
    }
}

/// One statement. `Nop` exists so passes can delete children in place.
#[derive(Debug, Clone)]
pub enum Stmt {
    Store {
        buf: Buf,
        indices: Vec<Expr>,
        value: Expr,
    },
    For(Box<For>),
    Block(Vec<Stmt>),
    Cond {
        condition: Expr,
        if_true: Box<Stmt>,
        if_false: Option<Box<Stmt>>,
    },
    Allocate {
        buf: Buf,
    },
    FreeBuf {
        buf: Buf,
    },
    Nop,
}

impl Stmt {
    pub fn store(buf: &Buf, indices: Vec<Expr>, value: Expr) -> Stmt {
        Stmt::Store {
            buf: buf.clone(),
            indices,
            value,
        }
    }

    pub fn loop_(var: Var, start: Expr, stop: Expr, body: Stmt) -> Stmt {
        Stmt::For(Box::new(For::new(var, start, stop, body)))
    }

    pub fn block(stmts: Vec<Stmt>) -> Stmt {
        Stmt::Block(stmts)
    }

    pub fn is_nop(&self) -> bool {
        matches!(self, Stmt::Nop)
    }
}

// Traversal helpers

/// Visit every statement in the tree, parents before children.
pub fn visit_stmt(s: &Stmt, f: &mut dyn FnMut(&Stmt)) {
    f(s);
    match s {
        Stmt::For(l) => visit_stmt(&l.body, f),
        Stmt::Block(stmts) => {
            for st in stmts {
                visit_stmt(st, f);
            }
        }
        Stmt::Cond {
            if_true, if_false, ..
        } => {
            visit_stmt(if_true, f);
            if let Some(e) = if_false {
                visit_stmt(e, f);
            }
        }
        _ => {}
    }
}

/// Visit every expression appearing anywhere in the tree.
pub fn visit_stmt_exprs(s: &Stmt, f: &mut dyn FnMut(&Expr)) {
    match s {
        Stmt::Store { indices, value, .. } => {
            for i in indices {
                visit_expr(i, f);
            }
            visit_expr(value, f);
        }
        Stmt::For(l) => {
            visit_expr(&l.start, f);
            visit_expr(&l.stop, f);
            visit_stmt_exprs(&l.body, f);
        }
        Stmt::Block(stmts) => {
            for st in stmts {
                visit_stmt_exprs(st, f);
            }
        }
        Stmt::Cond {
            condition,
            if_true,
            if_false,
        } => {
            visit_expr(condition, f);
            visit_stmt_exprs(if_true, f);
            if let Some(e) = if_false {
                visit_stmt_exprs(e, f);
            }
        }
        Stmt::Allocate { buf } | Stmt::FreeBuf { buf } => {
            for d in buf.dims() {
                visit_expr(d, f);
            }
        }
        Stmt::Nop => {}
    }
}

/// Rebuild the tree applying a post-order expression rewrite everywhere.
pub fn rewrite_stmt_exprs(s: &Stmt, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Stmt {
    match s {
        Stmt::Store {
            buf,
            indices,
            value,
        } => Stmt::Store {
            buf: buf.clone(),
            indices: indices.iter().map(|i| rewrite_expr(i, f)).collect(),
            value: rewrite_expr(value, f),
        },
        Stmt::For(l) => {
            let mut new_loop = For::new(
                l.var.clone(),
                rewrite_expr(&l.start, f),
                rewrite_expr(&l.stop, f),
                rewrite_stmt_exprs(&l.body, f),
            );
            new_loop.options = l.options.clone();
            Stmt::For(Box::new(new_loop))
        }
        Stmt::Block(stmts) => {
            Stmt::Block(stmts.iter().map(|st| rewrite_stmt_exprs(st, f)).collect())
        }
        Stmt::Cond {
            condition,
            if_true,
            if_false,
        } => Stmt::Cond {
            condition: rewrite_expr(condition, f),
            if_true: Box::new(rewrite_stmt_exprs(if_true, f)),
            if_false: if_false
                .as_ref()
                .map(|e| Box::new(rewrite_stmt_exprs(e, f))),
        },
        other => other.clone(),
    }
}

/// Whether any statement in the tree stores into `buf`.
pub fn stores_to(s: &Stmt, buf: &Buf) -> bool {
    let mut found = false;
    visit_stmt(s, &mut |st| {
        if let Stmt::Store { buf: b, .. } = st {
            if b == buf {
                found = true;
            }
        }
    });
    found
}

/// All buffers stored into anywhere in the tree, in first-store order.
pub fn stored_bufs(s: &Stmt) -> Vec<Buf> {
    let mut bufs: Vec<Buf> = Vec::new();
    visit_stmt(s, &mut |st| {
        if let Stmt::Store { buf, .. } = st {
            if !bufs.contains(buf) {
                bufs.push(buf.clone());
            }
        }
    });
    bufs
}

// Printing

fn fmt_indent(f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    for _ in 0..indent {
        write!(f, "  ")?;
    }
    Ok(())
}

fn fmt_stmt(s: &Stmt, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    match s {
        Stmt::Store {
            buf,
            indices,
            value,
        } => {
            fmt_indent(f, indent)?;
            write!(f, "{}[", buf.name())?;
            for (i, idx) in indices.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", idx)?;
            }
            writeln!(f, "] = {};", value)
        }
        Stmt::For(l) => {
            fmt_indent(f, indent)?;
            let mut marks = String::new();
            if l.options.parallel {
                marks.push_str(" /*parallel*/");
            }
            if l.options.vectorized {
                marks.push_str(" /*vectorize*/");
            }
            if let Some(b) = l.options.gpu_block_index {
                marks.push_str(&format!(" /*blockIdx.{}*/", b));
            }
            if let Some(t) = l.options.gpu_thread_index {
                marks.push_str(&format!(" /*threadIdx.{}*/", t));
            }
            writeln!(
                f,
                "for {} in {}..{}{} {{",
                l.var.name(),
                l.start,
                l.stop,
                marks
            )?;
            fmt_stmt(&l.body, f, indent + 1)?;
            fmt_indent(f, indent)?;
            writeln!(f, "}}")
        }
        Stmt::Block(stmts) => {
            for st in stmts {
                fmt_stmt(st, f, indent)?;
            }
            Ok(())
        }
        Stmt::Cond {
            condition,
            if_true,
            if_false,
        } => {
            fmt_indent(f, indent)?;
            writeln!(f, "if {} {{", condition)?;
            fmt_stmt(if_true, f, indent + 1)?;
            if let Some(e) = if_false {
                fmt_indent(f, indent)?;
                writeln!(f, "}} else {{")?;
                fmt_stmt(e, f, indent + 1)?;
            }
            fmt_indent(f, indent)?;
            writeln!(f, "}}")
        }
        Stmt::Allocate { buf } => {
            fmt_indent(f, indent)?;
            writeln!(f, "alloc {}: {}[{:?}];", buf.name(), buf.dtype(), buf.dims())
        }
        Stmt::FreeBuf { buf } => {
            fmt_indent(f, indent)?;
            writeln!(f, "free {};", buf.name())
        }
        Stmt::Nop => Ok(()),
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_stmt(self, f, 0)
    }
}

use std::collections::HashMap;

use log::debug;
use vole_core::{DType, Error, Result};

use crate::expr::{contains_rand, substitute, Buf, CmpOp, Expr, ExprNode, Var};
use crate::simplify::{const_trip_count, simplify_expr, simplify_stmt};
use crate::stmt::{
    rewrite_stmt_exprs, stored_bufs, visit_stmt, visit_stmt_exprs, For, Stmt,
};

// LoopNest — The transformation engine over statement trees
//
// A LoopNest owns the root statement and the set of output buffers, and
// applies the passes the kernel schedules between binding and codegen:
//
//   sanitize_names          unique loop index identifiers
//   simplify                constant folding, degenerate-loop removal
//   inline_intermediate_bufs
//                           replace loads of single-store pointwise
//                           buffers by their defining expressions
//   optimize_conditionals   split loops at compare-select cut points
//   flatten / split_with_mask
//                           index-space reshaping for parallel mapping
//   vectorize_inner_loops   innermost-loop markers for CPU backends
//   prepare_for_codegen     allocate remaining intermediates, linearize
//                           buffer indexing
//
// Passes rebuild the owned tree in place; buffers keep their identity
// throughout, which is what lets the kernel track outputs across passes.

pub struct LoopNest {
    root: Stmt,
    output_bufs: Vec<Buf>,
}

impl LoopNest {
    pub fn new(root: Stmt, output_bufs: Vec<Buf>) -> LoopNest {
        LoopNest { root, output_bufs }
    }

    pub fn root(&self) -> &Stmt {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Stmt {
        &mut self.root
    }

    pub fn into_root(self) -> Stmt {
        self.root
    }

    pub fn output_bufs(&self) -> &[Buf] {
        &self.output_bufs
    }

    /// Rename every loop index to a globally unique `i_<n>` identifier.
    pub fn sanitize_names(&mut self) {
        let mut counter = 0usize;
        let root = std::mem::replace(&mut self.root, Stmt::Nop);
        self.root = sanitize_rec(root, &mut counter);
    }

    pub fn simplify(&mut self) {
        self.root = simplify_stmt(&self.root);
    }

    /// Buffers written by the tree that are not kernel outputs.
    pub fn get_intermediate_bufs(&self) -> Vec<Buf> {
        stored_bufs(&self.root)
            .into_iter()
            .filter(|b| !self.output_bufs.contains(b))
            .collect()
    }

    /// Inline every intermediate buffer produced by a single pointwise
    /// store whose indices are exactly its loop axes. Loads of the buffer
    /// are replaced by the defining expression; the producer nest is
    /// removed. Work duplication is accepted — downstream codegen CSE (or
    /// sheer GPU arithmetic throughput) recovers it.
    ///
    /// Buffers written more than once (reductions), and values containing
    /// random sources, are left alone.
    pub fn inline_intermediate_bufs(&mut self, _allow_duplicated_work: bool) {
        let candidates = self.get_intermediate_bufs();
        for buf in candidates {
            if count_stores(&self.root, &buf) != 1 {
                continue;
            }
            let Some((axes, value)) = find_simple_producer(&self.root, &buf) else {
                continue;
            };
            if contains_rand(&value) {
                continue;
            }
            // Replace loads before removing the producer; the producer
            // itself never loads its own buffer (single pointwise store).
            let target = buf.clone();
            let axes_c = axes.clone();
            let value_c = value.clone();
            self.root = rewrite_stmt_exprs(&self.root, &mut |e| match e.node() {
                ExprNode::Load { buf: b, indices } if *b == target => {
                    let map: HashMap<Var, Expr> = axes_c
                        .iter()
                        .cloned()
                        .zip(indices.iter().cloned())
                        .collect();
                    Some(substitute(&value_c, &map))
                }
                _ => None,
            });
            remove_producer(&mut self.root, &buf);
            debug!("inlined intermediate buffer {}", buf.name());
        }
        // Removed producers leave no-op holes; sweep them so later passes
        // see loops as direct siblings again.
        if let Stmt::Block(stmts) = &mut self.root {
            stmts.retain(|s| !s.is_nop());
        }
    }

    /// Split loops whose bodies select on the loop index with `idx < c`
    /// comparisons (the shape the concat lowering emits) into contiguous
    /// subranges with the selects resolved.
    pub fn optimize_conditionals(&mut self) {
        let root = std::mem::replace(&mut self.root, Stmt::Nop);
        self.root = optimize_conditionals_rec(root);
    }

    /// Mark innermost loops with constant trip counts for vectorization.
    /// Only CPU code generators consume the marker.
    pub fn vectorize_inner_loops(&mut self) {
        mark_innermost(&mut self.root);
    }

    /// Prepare the tree for a code generator: insert allocations for the
    /// intermediate buffers in `to_allocate`, then linearize every load
    /// and store to a single flat index.
    pub fn prepare_for_codegen(&mut self, to_allocate: &[Buf]) {
        let root = std::mem::replace(&mut self.root, Stmt::Nop);
        let flattened = flatten_indices(root);
        if to_allocate.is_empty() {
            self.root = flattened;
            return;
        }
        let mut stmts: Vec<Stmt> = to_allocate
            .iter()
            .map(|b| Stmt::Allocate { buf: b.clone() })
            .collect();
        stmts.push(flattened);
        for b in to_allocate {
            stmts.push(Stmt::FreeBuf { buf: b.clone() });
        }
        self.root = Stmt::Block(stmts);
    }
}

fn sanitize_rec(s: Stmt, counter: &mut usize) -> Stmt {
    match s {
        Stmt::For(mut l) => {
            let fresh = Var::new(format!("i_{}", *counter), DType::I64);
            *counter += 1;
            let old = l.var.clone();
            let replacement = Expr::var(&fresh);
            let body = std::mem::replace(&mut *l.body, Stmt::Nop);
            let body = rewrite_stmt_exprs(&body, &mut |e| match e.node() {
                ExprNode::Var(v) if *v == old => Some(replacement.clone()),
                _ => None,
            });
            l.var = fresh;
            *l.body = sanitize_rec(body, counter);
            Stmt::For(l)
        }
        Stmt::Block(stmts) => Stmt::Block(
            stmts
                .into_iter()
                .map(|st| sanitize_rec(st, counter))
                .collect(),
        ),
        Stmt::Cond {
            condition,
            if_true,
            if_false,
        } => Stmt::Cond {
            condition,
            if_true: Box::new(sanitize_rec(*if_true, counter)),
            if_false: if_false.map(|e| Box::new(sanitize_rec(*e, counter))),
        },
        other => other,
    }
}

// Reduction and dependence queries

/// Whether any store's value reads the destination buffer (the shape of an
/// accumulating reduction).
pub fn has_reduction(s: &Stmt) -> bool {
    let mut found = false;
    visit_stmt(s, &mut |st| {
        if let Stmt::Store { buf, value, .. } = st {
            if crate::expr::loads_from(value, buf) {
                found = true;
            }
        }
    });
    found
}

/// Conservative loop-carried dependence test: some buffer is both loaded
/// and stored inside the tree.
pub fn has_loop_carried_dependence(s: &Stmt) -> bool {
    let stored = stored_bufs(s);
    let mut found = false;
    visit_stmt_exprs(s, &mut |e| {
        if let ExprNode::Load { buf, .. } = e.node() {
            if stored.contains(buf) {
                found = true;
            }
        }
    });
    found
}

/// Extents of every buffer accessed in the tree, keyed by name. Recorded
/// for the block backend before inlining erases intermediate structure.
pub fn buffer_map(s: &Stmt) -> HashMap<String, Vec<Expr>> {
    let mut map = HashMap::new();
    visit_stmt(s, &mut |st| {
        if let Stmt::Store { buf, .. } = st {
            map.insert(buf.name().to_string(), buf.dims().to_vec());
        }
    });
    visit_stmt_exprs(s, &mut |e| {
        if let ExprNode::Load { buf, .. } = e.node() {
            map.insert(buf.name().to_string(), buf.dims().to_vec());
        }
    });
    map
}

// Producer discovery for inlining

fn count_stores(s: &Stmt, buf: &Buf) -> usize {
    let mut n = 0;
    visit_stmt(s, &mut |st| {
        if let Stmt::Store { buf: b, .. } = st {
            if b == buf {
                n += 1;
            }
        }
    });
    n
}

/// When `buf` is produced by a perfect loop nest whose innermost statement
/// is a single store indexed exactly by the loop variables in order,
/// return those axis variables and the stored value.
fn find_simple_producer(root: &Stmt, buf: &Buf) -> Option<(Vec<Var>, Expr)> {
    let children: Vec<&Stmt> = match root {
        Stmt::Block(stmts) => stmts.iter().collect(),
        other => vec![other],
    };
    for child in children {
        let mut axes: Vec<Var> = Vec::new();
        let mut cur = child;
        loop {
            match cur {
                Stmt::For(l) => {
                    axes.push(l.var.clone());
                    cur = &l.body;
                }
                Stmt::Block(inner) if inner.len() == 1 => cur = &inner[0],
                Stmt::Store {
                    buf: b,
                    indices,
                    value,
                } if b == buf => {
                    if indices.len() != axes.len() {
                        return None;
                    }
                    let plain = indices
                        .iter()
                        .zip(axes.iter())
                        .all(|(idx, var)| idx.as_var() == Some(var));
                    if !plain {
                        return None;
                    }
                    return Some((axes, value.clone()));
                }
                _ => break,
            }
        }
    }
    None
}

/// Remove the nest that stores into `buf` from the root block.
fn remove_producer(root: &mut Stmt, buf: &Buf) {
    if let Stmt::Block(stmts) = root {
        for st in stmts.iter_mut() {
            if crate::stmt::stores_to(st, buf) {
                *st = Stmt::Nop;
                return;
            }
        }
    } else if crate::stmt::stores_to(root, buf) {
        *root = Stmt::Nop;
    }
}

// Conditional optimization

fn optimize_conditionals_rec(s: Stmt) -> Stmt {
    match s {
        Stmt::For(mut l) => {
            let body = std::mem::replace(&mut *l.body, Stmt::Nop);
            let body = optimize_conditionals_rec(body);
            let (Some(start), Some(stop)) = (
                simplify_expr(&l.start).as_long(),
                simplify_expr(&l.stop).as_long(),
            ) else {
                *l.body = body;
                return Stmt::For(l);
            };
            // Cut points: constants compared against this loop's index with
            // strictly-less-than selects.
            let mut cuts: Vec<i64> = Vec::new();
            visit_stmt_exprs(&body, &mut |e| {
                if let ExprNode::CompareSelect {
                    op: CmpOp::Lt,
                    lhs,
                    rhs,
                    ..
                } = e.node()
                {
                    if lhs.as_var() == Some(&l.var) {
                        if let Some(c) = rhs.as_long() {
                            if c > start && c < stop {
                                cuts.push(c);
                            }
                        }
                    }
                }
            });
            if cuts.is_empty() {
                *l.body = body;
                return Stmt::For(l);
            }
            cuts.sort_unstable();
            cuts.dedup();
            let mut bounds = vec![start];
            bounds.extend(cuts);
            bounds.push(stop);
            let mut segments: Vec<Stmt> = Vec::with_capacity(bounds.len() - 1);
            for win in bounds.windows(2) {
                let (lo, hi) = (win[0], win[1]);
                let var = l.var.clone();
                let seg_body = rewrite_stmt_exprs(&body, &mut |e| match e.node() {
                    ExprNode::CompareSelect {
                        op: CmpOp::Lt,
                        lhs,
                        rhs,
                        if_true,
                        if_false,
                    } if lhs.as_var() == Some(&var) => {
                        // Within [lo, hi) the comparison idx < c is decided.
                        match rhs.as_long() {
                            Some(c) if hi <= c => Some(if_true.clone()),
                            Some(c) if lo >= c => Some(if_false.clone()),
                            _ => None,
                        }
                    }
                    _ => None,
                });
                let mut seg = For::new(l.var.clone(), Expr::long(lo), Expr::long(hi), seg_body);
                seg.options = l.options.clone();
                segments.push(Stmt::For(Box::new(seg)));
            }
            debug!(
                "split conditional loop {} into {} ranges",
                l.var.name(),
                segments.len()
            );
            Stmt::Block(segments)
        }
        Stmt::Block(stmts) => Stmt::Block(
            stmts
                .into_iter()
                .map(optimize_conditionals_rec)
                .collect(),
        ),
        Stmt::Cond {
            condition,
            if_true,
            if_false,
        } => Stmt::Cond {
            condition,
            if_true: Box::new(optimize_conditionals_rec(*if_true)),
            if_false: if_false.map(|e| Box::new(optimize_conditionals_rec(*e))),
        },
        other => other,
    }
}

// Flattening and splitting

/// The chain of perfectly nested loops starting at `l`: each loop's body
/// is exactly the next loop (possibly wrapped in a one-element block).
pub fn perfect_nest_depth(l: &For) -> usize {
    let mut depth = 1;
    let mut cur = &l.body;
    loop {
        match cur.as_ref() {
            Stmt::For(inner) => {
                depth += 1;
                cur = &inner.body;
            }
            Stmt::Block(stmts) if stmts.len() == 1 => {
                if let Stmt::For(inner) = &stmts[0] {
                    depth += 1;
                    cur = &inner.body;
                } else {
                    break;
                }
            }
            _ => break,
        }
    }
    depth
}

fn take_inner(body: Stmt) -> std::result::Result<For, Stmt> {
    match body {
        Stmt::For(l) => Ok(*l),
        Stmt::Block(mut stmts) if stmts.len() == 1 => match stmts.pop() {
            Some(Stmt::For(l)) => Ok(*l),
            Some(other) => Err(other),
            None => Err(Stmt::Nop),
        },
        other => Err(other),
    }
}

/// Flatten the outermost `depth` loops of a perfect nest into a single
/// loop over the combined iteration space. All flattened loops must start
/// at zero; extents may be symbolic.
pub fn flatten(l: For, depth: usize) -> Result<For> {
    if depth <= 1 {
        return Ok(l);
    }
    let mut vars: Vec<Var> = Vec::with_capacity(depth);
    let mut stops: Vec<Expr> = Vec::with_capacity(depth);
    let mut cur = l;
    let body = loop {
        if simplify_expr(&cur.start).as_long() != Some(0) {
            return Err(Error::internal(format!(
                "cannot flatten loop {}: non-zero start bound",
                cur.var.name()
            )));
        }
        vars.push(cur.var.clone());
        stops.push(cur.stop.clone());
        if vars.len() == depth {
            break *cur.body;
        }
        match take_inner(*cur.body) {
            Ok(inner) => cur = inner,
            Err(_) => {
                return Err(Error::internal(
                    "cannot flatten: loops are not perfectly nested".to_string(),
                ))
            }
        }
    };

    let flat_var = Var::new(format!("{}_flat", vars[0].name()), DType::I64);
    let flat_expr = Expr::var(&flat_var);
    let mut flat_stop = Expr::long(1);
    for s in &stops {
        flat_stop = flat_stop * s.clone();
    }
    let flat_stop = simplify_expr(&flat_stop);

    // var_k = (flat / prod(stops after k)) % stop_k; the outermost skips
    // the modulo since the division already bounds it.
    let mut map: HashMap<Var, Expr> = HashMap::new();
    for (k, var) in vars.iter().enumerate() {
        let mut inner_prod = Expr::long(1);
        for s in &stops[k + 1..] {
            inner_prod = inner_prod * s.clone();
        }
        let mut idx = flat_expr.clone() / simplify_expr(&inner_prod);
        if k > 0 {
            idx = idx % stops[k].clone();
        }
        map.insert(var.clone(), simplify_expr(&idx));
    }
    let body = rewrite_stmt_exprs(&body, &mut |e| match e.node() {
        ExprNode::Var(v) => map.get(v).cloned(),
        _ => None,
    });
    Ok(For::new(flat_var, Expr::long(0), flat_stop, body))
}

/// Split a loop by `factor` into an outer/inner pair, masking the tail
/// iteration when the factor does not divide the trip count evenly.
/// Returns the outer loop; the inner loop is its direct body.
pub fn split_with_mask(l: For, factor: i64) -> For {
    let For {
        var,
        start,
        stop,
        body,
        options,
    } = l;
    let trip = simplify_expr(&(stop.clone() - start.clone()));
    let outer_var = Var::new(format!("{}_outer", var.name()), DType::I64);
    let inner_var = Var::new(format!("{}_inner", var.name()), DType::I64);
    let combined = simplify_expr(
        &(Expr::var(&outer_var) * Expr::long(factor) + Expr::var(&inner_var) + start.clone()),
    );
    let needs_mask = match trip.as_long() {
        Some(t) => t % factor != 0,
        None => true,
    };
    let mut new_body = rewrite_stmt_exprs(&body, &mut |e| match e.node() {
        ExprNode::Var(v) if *v == var => Some(combined.clone()),
        _ => None,
    });
    if needs_mask {
        let cond = Expr::compare_select(
            CmpOp::Lt,
            combined,
            stop,
            Expr::bool_imm(true),
            Expr::bool_imm(false),
        );
        new_body = Stmt::Cond {
            condition: cond,
            if_true: Box::new(new_body),
            if_false: None,
        };
    }
    let inner = For::new(inner_var, Expr::long(0), Expr::long(factor), new_body);
    let outer_stop = simplify_expr(
        &((trip + Expr::long(factor - 1)) / Expr::long(factor)),
    );
    let mut outer = For::new(outer_var, Expr::long(0), outer_stop, Stmt::For(Box::new(inner)));
    outer.options = options;
    outer
}

/// Trip counts of the loops enclosing the (first) store to `buf`,
/// outermost first. `None` entries are symbolic extents.
pub fn enclosing_loop_trip_counts(root: &Stmt, buf: &Buf) -> Option<Vec<Option<i64>>> {
    fn rec(s: &Stmt, buf: &Buf, acc: &mut Vec<Option<i64>>) -> bool {
        match s {
            Stmt::Store { buf: b, .. } => b == buf,
            Stmt::For(l) => {
                acc.push(const_trip_count(l));
                if rec(&l.body, buf, acc) {
                    true
                } else {
                    acc.pop();
                    false
                }
            }
            Stmt::Block(stmts) => stmts.iter().any(|st| rec(st, buf, acc)),
            Stmt::Cond {
                if_true, if_false, ..
            } => {
                rec(if_true, buf, acc)
                    || if_false.as_ref().map(|e| rec(e, buf, acc)).unwrap_or(false)
            }
            _ => false,
        }
    }
    let mut acc = Vec::new();
    if rec(root, buf, &mut acc) {
        Some(acc)
    } else {
        None
    }
}

/// Find the top-level loop whose subtree stores into `buf` and replace it
/// with `f(loop)`. Returns false when no such loop exists (0-dim outputs
/// have bare stores).
pub fn rewrite_nest_for_buf(
    root: &mut Stmt,
    buf: &Buf,
    f: impl FnOnce(For) -> Result<Stmt>,
) -> Result<bool> {
    let slots: Vec<&mut Stmt> = match root {
        Stmt::Block(stmts) => stmts.iter_mut().collect(),
        other => vec![other],
    };
    for slot in slots {
        let is_match = match &*slot {
            Stmt::For(_) => crate::stmt::stores_to(slot, buf),
            _ => false,
        };
        if !is_match {
            continue;
        }
        let owned = std::mem::replace(slot, Stmt::Nop);
        if let Stmt::For(l) = owned {
            *slot = f(*l)?;
            return Ok(true);
        } else {
            *slot = owned;
        }
    }
    Ok(false)
}

// Index linearization

fn linear_index(buf: &Buf, indices: &[Expr]) -> Expr {
    if indices.len() == 1 {
        return indices[0].clone();
    }
    if indices.is_empty() {
        return Expr::long(0);
    }
    let dims = buf.dims();
    let mut flat = Expr::long(0);
    for (j, idx) in indices.iter().enumerate() {
        let mut stride = Expr::long(1);
        for d in &dims[j + 1..] {
            stride = stride * d.clone();
        }
        flat = flat + idx.clone() * stride;
    }
    simplify_expr(&flat)
}

fn flatten_indices(s: Stmt) -> Stmt {
    // Loads are handled by the expression rewrite; stores need their own
    // pass since indices live on the statement.
    let s = rewrite_stmt_exprs(&s, &mut |e| match e.node() {
        ExprNode::Load { buf, indices } if indices.len() != 1 => {
            Some(Expr::load(buf, vec![linear_index(buf, indices)]))
        }
        _ => None,
    });
    flatten_store_indices(s)
}

fn flatten_store_indices(s: Stmt) -> Stmt {
    match s {
        Stmt::Store {
            buf,
            indices,
            value,
        } => {
            let flat = linear_index(&buf, &indices);
            Stmt::Store {
                buf,
                indices: vec![flat],
                value,
            }
        }
        Stmt::For(mut l) => {
            let body = std::mem::replace(&mut *l.body, Stmt::Nop);
            *l.body = flatten_store_indices(body);
            Stmt::For(l)
        }
        Stmt::Block(stmts) => {
            Stmt::Block(stmts.into_iter().map(flatten_store_indices).collect())
        }
        Stmt::Cond {
            condition,
            if_true,
            if_false,
        } => Stmt::Cond {
            condition,
            if_true: Box::new(flatten_store_indices(*if_true)),
            if_false: if_false.map(|e| Box::new(flatten_store_indices(*e))),
        },
        other => other,
    }
}

fn contains_loop(s: &Stmt) -> bool {
    let mut found = false;
    visit_stmt(s, &mut |st| {
        if matches!(st, Stmt::For(_)) {
            found = true;
        }
    });
    found
}

fn mark_innermost(s: &mut Stmt) {
    match s {
        Stmt::For(l) => {
            if contains_loop(&l.body) {
                mark_innermost(&mut l.body);
            } else if const_trip_count(l).is_some() {
                l.options.vectorized = true;
            }
        }
        Stmt::Block(stmts) => {
            for st in stmts {
                mark_innermost(st);
            }
        }
        Stmt::Cond {
            if_true, if_false, ..
        } => {
            mark_innermost(if_true);
            if let Some(e) = if_false {
                mark_innermost(e);
            }
        }
        _ => {}
    }
}

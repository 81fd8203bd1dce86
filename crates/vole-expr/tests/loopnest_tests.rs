// LoopNest Tests — Transformation passes over small hand-built nests

use vole_core::{DType, Device, Tensor};
use vole_expr::loopnest::{flatten, has_loop_carried_dependence, has_reduction, split_with_mask};
use vole_expr::{
    compute, reduce, BufferArg, CallArg, CodeGen, Expr, For, LoopNest, SimpleIrEval, Stmt,
};

// Helpers

fn dims(extents: &[i64]) -> Vec<Expr> {
    extents.iter().map(|&e| Expr::long(e)).collect()
}

fn collect_loops(stmt: &Stmt, out: &mut Vec<For>) {
    match stmt {
        Stmt::For(l) => {
            out.push((**l).clone());
            collect_loops(&l.body, out);
        }
        Stmt::Block(stmts) => {
            for s in stmts {
                collect_loops(s, out);
            }
        }
        Stmt::Cond {
            if_true, if_false, ..
        } => {
            collect_loops(if_true, out);
            if let Some(e) = if_false {
                collect_loops(e, out);
            }
        }
        _ => {}
    }
}

fn loops_of(stmt: &Stmt) -> Vec<For> {
    let mut out = Vec::new();
    collect_loops(stmt, &mut out);
    out
}

// Simplification

#[test]
fn simplify_folds_constants() {
    let t = compute("t", &dims(&[4]), DType::F32, |axes| {
        Ok((Expr::float(2.0) * Expr::float(3.0)) + axes[0].clone() * Expr::long(0))
    })
    .unwrap();
    let mut nest = LoopNest::new(t.stmt.unwrap(), vec![t.buf.unwrap()]);
    nest.simplify();
    let loops = loops_of(nest.root());
    assert_eq!(loops.len(), 1);
    // The stored value should have folded to the constant 6.
    let Stmt::Store { value, .. } = &*loops[0].body else {
        panic!("expected a store under the loop, got {}", loops[0].body);
    };
    assert_eq!(value.as_double(), Some(6.0));
}

#[test]
fn simplify_drops_empty_and_single_iteration_loops() {
    let t = compute("t", &dims(&[1, 8]), DType::F32, |axes| {
        Ok(axes[0].clone() + axes[1].clone())
    })
    .unwrap();
    let mut nest = LoopNest::new(t.stmt.unwrap(), vec![t.buf.unwrap()]);
    nest.simplify();
    // The size-1 outer loop is gone; only the 8-trip loop remains.
    let loops = loops_of(nest.root());
    assert_eq!(loops.len(), 1);
    assert_eq!(loops[0].stop.as_long(), Some(8));

    let dead = compute("dead", &dims(&[0, 8]), DType::F32, |_| Ok(Expr::float(1.0))).unwrap();
    let mut nest = LoopNest::new(dead.stmt.unwrap(), vec![]);
    nest.simplify();
    assert!(loops_of(nest.root()).is_empty());
}

// Flatten and split

#[test]
fn flatten_merges_perfect_nest() {
    let t = compute("t", &dims(&[2, 16, 1024]), DType::F32, |axes| {
        Ok(axes[0].clone() + axes[1].clone() + axes[2].clone())
    })
    .unwrap();
    let Stmt::For(top) = t.stmt.unwrap() else {
        panic!("compute did not produce a loop");
    };
    let flat = flatten(*top, 3).unwrap();
    assert_eq!(flat.stop.as_long(), Some(2 * 16 * 1024));
    // The flattened loop directly contains the store.
    let inner = loops_of(&flat.body);
    assert!(inner.is_empty());
}

#[test]
fn split_with_mask_divisible_has_no_mask() {
    let t = compute("t", &dims(&[1024]), DType::F32, |axes| Ok(axes[0].clone())).unwrap();
    let Stmt::For(top) = t.stmt.unwrap() else {
        panic!("compute did not produce a loop");
    };
    let outer = split_with_mask(*top, 512);
    assert_eq!(outer.stop.as_long(), Some(2));
    let Stmt::For(inner) = &*outer.body else {
        panic!("split did not produce an inner loop");
    };
    assert_eq!(inner.stop.as_long(), Some(512));
    // 512 divides 1024: the store is unguarded.
    assert!(matches!(&*inner.body, Stmt::Store { .. }));
}

#[test]
fn split_with_mask_ragged_guards_the_tail() {
    let t = compute("t", &dims(&[100]), DType::F32, |axes| Ok(axes[0].clone())).unwrap();
    let Stmt::For(top) = t.stmt.unwrap() else {
        panic!("compute did not produce a loop");
    };
    let outer = split_with_mask(*top, 64);
    assert_eq!(outer.stop.as_long(), Some(2));
    let Stmt::For(inner) = &*outer.body else {
        panic!("split did not produce an inner loop");
    };
    assert!(matches!(&*inner.body, Stmt::Cond { .. }));
}

// Inlining

#[test]
fn inline_removes_pointwise_producer() {
    let a = compute("a", &dims(&[8]), DType::F32, |axes| {
        Ok(axes[0].clone() * Expr::long(2))
    })
    .unwrap();
    let a_buf = a.buf.clone().unwrap();
    let b = compute("b", &dims(&[8]), DType::F32, |axes| {
        Ok(Expr::load(&a_buf, vec![axes[0].clone()]) + Expr::float(3.0))
    })
    .unwrap();
    let b_buf = b.buf.clone().unwrap();
    let root = Stmt::block(vec![a.stmt.unwrap(), b.stmt.unwrap()]);
    let mut nest = LoopNest::new(root, vec![b_buf]);
    nest.inline_intermediate_bufs(true);
    nest.simplify();
    // Only b's nest remains, and nothing loads a anymore.
    let loops = loops_of(nest.root());
    assert_eq!(loops.len(), 1);
    assert!(nest.get_intermediate_bufs().is_empty());
}

#[test]
fn inline_leaves_reductions_alone() {
    let input = compute("x", &dims(&[8]), DType::F32, |axes| Ok(axes[0].clone())).unwrap();
    let x_buf = input.buf.clone().unwrap();
    let total = reduce(
        "total",
        &[],
        DType::F32,
        &dims(&[8]),
        |_| Ok(Expr::float(0.0)),
        |_, r| Ok(Expr::load(&x_buf, vec![r[0].clone()])),
    )
    .unwrap();
    let total_buf = total.buf.clone().unwrap();
    let root = Stmt::block(vec![input.stmt.unwrap(), total.stmt.unwrap()]);
    assert!(has_reduction(&root));
    assert!(has_loop_carried_dependence(&root));

    let mut nest = LoopNest::new(root, vec![total_buf.clone()]);
    nest.inline_intermediate_bufs(true);
    // x was inlined into the accumulation; total (two stores) was not
    // touched and is still the only intermediate-free producer.
    assert!(has_reduction(nest.root()));
    assert!(!nest.get_intermediate_bufs().contains(&total_buf));
}

// Conditional optimization

#[test]
fn optimize_conditionals_splits_on_cut_points() {
    use vole_expr::CmpOp;
    let t = compute("t", &dims(&[8]), DType::F32, |axes| {
        Ok(Expr::compare_select(
            CmpOp::Lt,
            axes[0].clone(),
            Expr::long(4),
            Expr::float(1.0),
            Expr::float(2.0),
        ))
    })
    .unwrap();
    let mut nest = LoopNest::new(t.stmt.unwrap(), vec![t.buf.unwrap()]);
    nest.optimize_conditionals();
    let loops = loops_of(nest.root());
    assert_eq!(loops.len(), 2);
    assert_eq!(
        (loops[0].start.as_long(), loops[0].stop.as_long()),
        (Some(0), Some(4))
    );
    assert_eq!(
        (loops[1].start.as_long(), loops[1].stop.as_long()),
        (Some(4), Some(8))
    );
    // Each segment's store is select-free.
    for l in &loops {
        let Stmt::Store { value, .. } = &*l.body else {
            panic!("expected a bare store");
        };
        assert!(value.as_double().is_some());
    }
}

// Codegen preparation and evaluation

#[test]
fn prepare_for_codegen_allocates_and_linearizes() {
    let a = compute("a", &dims(&[2, 3]), DType::F32, |axes| {
        Ok(axes[0].clone() + axes[1].clone())
    })
    .unwrap();
    let a_buf = a.buf.clone().unwrap();
    let b = compute("b", &dims(&[2, 3]), DType::F32, |axes| {
        Ok(Expr::load(&a_buf, vec![axes[0].clone(), axes[1].clone()]) * Expr::float(2.0))
    })
    .unwrap();
    let b_buf = b.buf.clone().unwrap();
    let root = Stmt::block(vec![a.stmt.unwrap(), b.stmt.unwrap()]);
    let mut nest = LoopNest::new(root, vec![b_buf.clone()]);
    let intermediates = nest.get_intermediate_bufs();
    assert_eq!(intermediates, vec![a_buf]);
    nest.prepare_for_codegen(&intermediates);

    let mut saw_alloc = false;
    vole_expr::stmt::visit_stmt(nest.root(), &mut |s| {
        if matches!(s, Stmt::Allocate { .. }) {
            saw_alloc = true;
        }
        if let Stmt::Store { indices, .. } = s {
            assert_eq!(indices.len(), 1);
        }
    });
    assert!(saw_alloc);

    // The prepared tree actually evaluates: b[i][j] = (i + j) * 2.
    let eval = SimpleIrEval::new(
        nest.into_root(),
        vec![BufferArg::Buf(b_buf)],
        "prepared",
    );
    let mut out = Tensor::zeros(&[2, 3], DType::F32, Device::Cpu);
    eval.call(&[CallArg::Ptr(out.data_ptr_mut())]).unwrap();
    assert_eq!(
        out.as_f32().unwrap(),
        &[0.0, 2.0, 4.0, 2.0, 4.0, 6.0]
    );
}

#[test]
fn evaluator_runs_zero_dim_stores() {
    let t = compute("t", &[], DType::F32, |_| Ok(Expr::float(7.0))).unwrap();
    let buf = t.buf.clone().unwrap();
    let mut nest = LoopNest::new(t.stmt.unwrap(), vec![buf.clone()]);
    nest.prepare_for_codegen(&[]);
    let eval = SimpleIrEval::new(nest.into_root(), vec![BufferArg::Buf(buf)], "zero_dim");
    let mut out = Tensor::zeros(&[], DType::F32, Device::Cpu);
    eval.call(&[CallArg::Ptr(out.data_ptr_mut())]).unwrap();
    assert_eq!(out.as_f32().unwrap(), &[7.0]);
}

#[test]
fn sanitize_names_uniquifies_loop_indices() {
    let a = compute("a", &dims(&[4]), DType::F32, |axes| Ok(axes[0].clone())).unwrap();
    let b = compute("b", &dims(&[4]), DType::F32, |axes| Ok(axes[0].clone())).unwrap();
    let root = Stmt::block(vec![a.stmt.unwrap(), b.stmt.unwrap()]);
    let mut nest = LoopNest::new(root, vec![]);
    nest.sanitize_names();
    let loops = loops_of(nest.root());
    let names: Vec<&str> = loops.iter().map(|l| l.var.name()).collect();
    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
}

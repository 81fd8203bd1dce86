use std::collections::HashMap;

use log::debug;
use vole_core::{DType, Error, Result};
use vole_expr::loopnest::{
    enclosing_loop_trip_counts, flatten, has_loop_carried_dependence, has_reduction,
    perfect_nest_depth, rewrite_nest_for_buf, split_with_mask,
};
use vole_expr::simplify::const_trip_count;
use vole_expr::{Expr, For, LoopNest, Stmt};

use crate::config::CompileConfig;

// Scheduling — Backend-specific loop transformations
//
// The kernel's transform pipeline calls into this module per backend:
// horizontal fusion and outer-loop parallelization for the LLVM CPU path,
// flatten-and-split with block/thread binding for the CUDA and block
// paths. Everything here manipulates the loop-nest tree; nothing executes.

/// Minimum inner-loop trip product below which outer-loop parallelism is
/// not worthwhile.
pub const MIN_GRAIN_SIZE: i64 = 32768;

const CUDA_DEFAULT_LOOP_LEVELS: i64 = 2;
const CUDA_DEFAULT_BLOCK_COUNT: i64 = 1280;
const CUDA_DEFAULT_BLOCK_SIZE_2LEVEL: i64 = 512;
const CUDA_DEFAULT_BLOCK_SIZE_3LEVEL: i64 = 256;

const BLOCK_DEFAULT_FP16_BLOCKSIZE: i64 = 16;
const BLOCK_DEFAULT_UINT8_BLOCKSIZE: i64 = 32;

/// The (start, stop) bounds of a loop when both are constants.
fn loop_bounds(l: &For) -> Option<(i64, i64)> {
    use vole_expr::simplify::simplify_expr;
    let start = simplify_expr(&l.start).as_long()?;
    let stop = simplify_expr(&l.stop).as_long()?;
    Some((start, stop))
}

fn loop_bounds_all_equal(loops: &[&For]) -> bool {
    let Some(first) = loops.first().and_then(|l| loop_bounds(l)) else {
        return false;
    };
    loops.iter().all(|l| loop_bounds(l) == Some(first))
}

/// Recursively fuse all sibling loops with matching constant bounds.
/// Stops at any level containing non-loops or non-matching bounds; the
/// constant-equal-bounds requirement avoids inserting index guards that
/// would block later vectorization.
pub fn fuse_all_loops(st: &mut Stmt) {
    let Stmt::Block(stmts) = st else {
        // A lone loop at this level: nothing to fuse, but keep descending
        // so nests fused higher up continue merging below.
        if let Stmt::For(l) = st {
            fuse_all_loops(&mut l.body);
        }
        return;
    };
    if !stmts.iter().all(|s| matches!(s, Stmt::For(_))) {
        return;
    }
    if stmts.is_empty() {
        return;
    }
    {
        let loops: Vec<&For> = stmts
            .iter()
            .map(|s| match s {
                Stmt::For(l) => l.as_ref(),
                _ => unreachable!(),
            })
            .collect();
        if !loop_bounds_all_equal(&loops) {
            return;
        }
    }
    // Take ownership and merge bodies under the first loop's index.
    let owned = std::mem::take(stmts);
    if owned.len() == 1 {
        if let Some(only) = owned.into_iter().next() {
            *st = only;
        }
        if let Stmt::For(l) = st {
            fuse_all_loops(&mut l.body);
        }
        return;
    }
    let count = owned.len();
    let mut iter = owned.into_iter();
    let Some(Stmt::For(first)) = iter.next() else {
        unreachable!();
    };
    let mut fused = *first;
    let mut bodies: Vec<Stmt> = Vec::with_capacity(count);
    push_spliced(&mut bodies, std::mem::replace(&mut *fused.body, Stmt::Nop));
    for s in iter {
        let Stmt::For(other) = s else { unreachable!() };
        let target = fused.var.clone();
        let replacement = Expr::var(&target);
        let body = vole_expr::stmt::rewrite_stmt_exprs(&other.body, &mut |e| {
            match e.node() {
                vole_expr::ExprNode::Var(v) if *v == other.var => Some(replacement.clone()),
                _ => None,
            }
        });
        push_spliced(&mut bodies, body);
    }
    *fused.body = Stmt::Block(bodies);
    debug!("fused {} sibling loops into {}", count, fused.var.name());
    *st = Stmt::For(Box::new(fused));
    if let Stmt::For(l) = st {
        fuse_all_loops(&mut l.body);
    }
}

/// Append a statement to a fused body, splicing block nesting so sibling
/// loops stay direct children and remain visible to further fusion.
fn push_spliced(bodies: &mut Vec<Stmt>, body: Stmt) {
    match body {
        Stmt::Block(inner) => bodies.extend(inner),
        other => bodies.push(other),
    }
}

/// Prune innermost loops until the accumulated trip product clears the
/// grain size. Symbolic extents stop the scan.
pub fn prune_by_grain_size(trip_counts: &mut Vec<Option<i64>>) {
    let mut grain = 1i64;
    while let Some(last) = trip_counts.last() {
        let Some(tc) = *last else { break };
        grain *= tc;
        if grain <= MIN_GRAIN_SIZE {
            trip_counts.pop();
        } else {
            break;
        }
    }
}

/// Retain just enough outermost loops to fill `threads`.
pub fn prune_by_thread_count(trip_counts: &mut Vec<Option<i64>>, threads: usize) {
    let mut trips = 1i64;
    let mut keep = 0usize;
    for tc in trip_counts.iter() {
        if trips >= threads as i64 {
            break;
        }
        let Some(tc) = *tc else { break };
        trips *= tc;
        keep += 1;
    }
    trip_counts.truncate(keep);
}

/// Flatten and parallelize the outer loops of each output's nest, subject
/// to a minimum number of elements in the inner loops and a maximum level
/// of thread-level parallelism in the outer loops.
pub fn parallelize_outer_loops(nest: &mut LoopNest) -> Result<()> {
    let outputs = nest.output_bufs().to_vec();
    let threads = rayon::current_num_threads();
    for buf in outputs {
        let Some(mut trips) = enclosing_loop_trip_counts(nest.root(), &buf) else {
            continue;
        };
        prune_by_grain_size(&mut trips);
        prune_by_thread_count(&mut trips, threads);
        let keep = trips.len();
        // There are no loops to parallelize; give up.
        if keep == 0 {
            continue;
        }
        // A reduction writes this buffer (its initialization and
        // accumulation are separate nests); keep the whole thing serial.
        let mut buf_is_reduced = false;
        vole_expr::stmt::visit_stmt(nest.root(), &mut |st| {
            if let Stmt::Store { buf: b, value, .. } = st {
                if *b == buf && vole_expr::expr::loads_from(value, &buf) {
                    buf_is_reduced = true;
                }
            }
        });
        if buf_is_reduced {
            continue;
        }
        rewrite_nest_for_buf(nest.root_mut(), &buf, |top| {
            let probe = Stmt::For(Box::new(top));
            // Reductions and loop-carried dependences stay serial.
            if has_reduction(&probe) || has_loop_carried_dependence(&probe) {
                return Ok(probe);
            }
            let Stmt::For(top) = probe else { unreachable!() };
            if keep == 1 {
                let mut l = *top;
                l.options.parallel = true;
                debug!("parallelized loop {}", l.var.name());
                return Ok(Stmt::For(Box::new(l)));
            }
            if perfect_nest_depth(&top) < keep {
                // Cannot flatten across a non-perfect nest; give up.
                return Ok(Stmt::For(top));
            }
            let mut flat = flatten(*top, keep)?;
            flat.options.parallel = true;
            debug!("flattened {} loops and parallelized {}", keep, flat.var.name());
            Ok(Stmt::For(Box::new(flat)))
        })?;
    }
    Ok(())
}

/// Flatten each output's nest and split it for the CUDA grid: 2-level
/// (block/thread) or 3-level (serial/block/thread) per the configuration.
pub fn split_for_cuda(nest: &mut LoopNest, config: &CompileConfig) -> Result<()> {
    let loop_levels = if config.cuda_pointwise_loop_levels > 0 {
        config.cuda_pointwise_loop_levels
    } else {
        CUDA_DEFAULT_LOOP_LEVELS
    };
    if loop_levels != 2 && loop_levels != 3 {
        return Err(Error::constraint(format!(
            "invalid loop-level: {}",
            loop_levels
        )));
    }
    let outputs = nest.output_bufs().to_vec();
    for buf in outputs {
        let Some(trips) = enclosing_loop_trip_counts(nest.root(), &buf) else {
            continue;
        };
        // 0-dim buffers have bare stores with no loops to map.
        if trips.is_empty() {
            continue;
        }
        let depth = trips.len();
        rewrite_nest_for_buf(nest.root_mut(), &buf, |top| {
            let flat = flatten(top, depth)?;
            if loop_levels == 2 {
                let block_size = if config.cuda_pointwise_block_size > 0 {
                    config.cuda_pointwise_block_size
                } else {
                    CUDA_DEFAULT_BLOCK_SIZE_2LEVEL
                };
                let mut outer = split_with_mask(flat, block_size);
                outer.options.gpu_block_index = Some(0);
                if let Some(inner) = outer.first_inner_loop_mut() {
                    inner.options.gpu_thread_index = Some(0);
                }
                Ok(Stmt::For(Box::new(outer)))
            } else {
                let block_count = if config.cuda_pointwise_block_count > 0 {
                    config.cuda_pointwise_block_count
                } else {
                    CUDA_DEFAULT_BLOCK_COUNT
                };
                let block_size = if config.cuda_pointwise_block_size > 0 {
                    config.cuda_pointwise_block_size
                } else {
                    CUDA_DEFAULT_BLOCK_SIZE_3LEVEL
                };
                let mut serial = split_with_mask(flat, block_count * block_size);
                let inner_stmt = std::mem::replace(&mut *serial.body, Stmt::Nop);
                let Stmt::For(inner) = inner_stmt else {
                    return Err(Error::internal(
                        "split_with_mask did not produce an inner loop",
                    ));
                };
                let mut blocks = split_with_mask(*inner, block_size);
                blocks.options.gpu_block_index = Some(0);
                if let Some(threads) = blocks.first_inner_loop_mut() {
                    threads.options.gpu_thread_index = Some(0);
                }
                *serial.body = Stmt::For(Box::new(blocks));
                Ok(Stmt::For(Box::new(serial)))
            }
        })?;
    }
    Ok(())
}

/// Block-backend block size for a buffer's dtype.
pub fn block_size_for_dtype(dtype: DType) -> i64 {
    if dtype == DType::U8 {
        BLOCK_DEFAULT_UINT8_BLOCKSIZE
    } else {
        BLOCK_DEFAULT_FP16_BLOCKSIZE
    }
}

/// Flatten and split each output's nest for the block backend, attaching
/// the pre-inlining buffer dimension map to the block-bound loop.
pub fn split_for_block(
    nest: &mut LoopNest,
    buffer_dims: HashMap<String, Vec<Expr>>,
) -> Result<()> {
    let outputs = nest.output_bufs().to_vec();
    for buf in outputs {
        let block_size = block_size_for_dtype(buf.dtype());
        let trips = enclosing_loop_trip_counts(nest.root(), &buf);
        let depth = match &trips {
            Some(t) if !t.is_empty() => t.len(),
            _ => {
                return Err(Error::internal(format!(
                    "no loops found for the buffer {}",
                    buf.name()
                )))
            }
        };
        let map = buffer_dims.clone();
        rewrite_nest_for_buf(nest.root_mut(), &buf, |top| {
            let flat = flatten(top, depth)?;
            let mut outer = split_with_mask(flat, block_size);
            outer.options.gpu_block_index = Some(0);
            if let Some(inner) = outer.first_inner_loop_mut() {
                inner.options.gpu_thread_index = Some(0);
            }
            outer.options.buffer_map = Some(map);
            Ok(Stmt::For(Box::new(outer)))
        })?;
    }
    Ok(())
}

/// Trip count of a loop if constant (bounds helper shared with tests).
pub fn trip_count(l: &For) -> Option<i64> {
    const_trip_count(l)
}

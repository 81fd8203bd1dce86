use std::collections::HashMap;

use vole_core::{
    contiguous_strides, numel, DType, Error, Result, Tensor, TensorData,
};
use vole_ir::{ConstantValue, Graph, Node, OpKind, ValueId};

use crate::stack::{Stack, StackValue};

// Graph interpreter — The fallback execution path
//
// Walks the subgraph in node order, dispatching each operator to a plain
// tensor-level implementation. This is what `run` diverts to when the
// compiled kernel is unavailable or fails, and what differential tests
// compare the compiled path against. Precision note: arithmetic is done
// in f64 and narrowed to the output dtype, matching the expression
// evaluator's behavior.

#[derive(Debug, Clone)]
enum RtVal {
    Tensor(Tensor),
    Int(i64),
    Double(f64),
    Bool(bool),
    IntList(Vec<i64>),
    DoubleList(Vec<f64>),
    List(Vec<RtVal>),
    None,
}

fn to_f64_vec(t: &Tensor) -> Result<Vec<f64>> {
    let c = t.clone_contiguous();
    if let Some(v) = c.as_f32() {
        return Ok(v.iter().map(|&x| x as f64).collect());
    }
    if let Some(v) = c.as_f64() {
        return Ok(v.to_vec());
    }
    if let Some(v) = c.as_i64() {
        return Ok(v.iter().map(|&x| x as f64).collect());
    }
    if let Some(v) = c.as_u8() {
        return Ok(v.iter().map(|&x| x as f64).collect());
    }
    Err(Error::UnsupportedDtype(format!(
        "fallback interpreter cannot read {} tensors",
        t.dtype()
    )))
}

fn from_f64_vec(values: Vec<f64>, sizes: &[i64], dtype: DType) -> Result<Tensor> {
    let data = match dtype {
        DType::F32 => TensorData::F32(values.into_iter().map(|x| x as f32).collect()),
        DType::F64 => TensorData::F64(values),
        DType::I64 => TensorData::I64(values.into_iter().map(|x| x as i64).collect()),
        DType::U8 => TensorData::U8(values.into_iter().map(|x| x as i64 as u8).collect()),
        DType::Bool => TensorData::Bool(values.into_iter().map(|x| x != 0.0).collect()),
        other => {
            return Err(Error::UnsupportedDtype(format!(
                "fallback interpreter cannot produce {} tensors",
                other
            )))
        }
    };
    Tensor::from_data(data, sizes, vole_core::Device::Cpu)
}

/// Flat index into `sizes` for logical position `index`, broadcasting
/// extent-1 dimensions and right-aligning lower ranks.
fn broadcast_offset(index: &[i64], sizes: &[i64]) -> i64 {
    let strides = contiguous_strides(sizes);
    let skip = index.len() - sizes.len();
    let mut off = 0;
    for (j, (&size, &stride)) in sizes.iter().zip(strides.iter()).enumerate() {
        let i = if size == 1 { 0 } else { index[skip + j] };
        off += i * stride;
    }
    off
}

fn odometer(index: &mut [i64], sizes: &[i64]) {
    for d in (0..sizes.len()).rev() {
        index[d] += 1;
        if index[d] < sizes[d] {
            return;
        }
        index[d] = 0;
    }
}

fn binary_op(op: &OpKind, a: &Tensor, b: &Tensor, out_sizes: &[i64], dtype: DType) -> Result<Tensor> {
    let av = to_f64_vec(a)?;
    let bv = to_f64_vec(b)?;
    let n = numel(out_sizes).max(0) as usize;
    let mut out = Vec::with_capacity(n);
    let mut index = vec![0i64; out_sizes.len()];
    for _ in 0..n {
        let x = av[broadcast_offset(&index, a.sizes()) as usize];
        let y = bv[broadcast_offset(&index, b.sizes()) as usize];
        out.push(match op {
            OpKind::Add => x + y,
            OpKind::Sub => x - y,
            OpKind::Mul => x * y,
            OpKind::Div => x / y,
            _ => return Err(Error::internal("not a binary op")),
        });
        odometer(&mut index, out_sizes);
    }
    from_f64_vec(out, out_sizes, dtype)
}

fn unary_op(op: &OpKind, a: &Tensor, dtype: DType) -> Result<Tensor> {
    let av = to_f64_vec(a)?;
    let out: Vec<f64> = av
        .into_iter()
        .map(|x| match op {
            OpKind::Neg => -x,
            OpKind::Abs => x.abs(),
            OpKind::Exp => x.exp(),
            OpKind::Log => x.ln(),
            OpKind::Sqrt => x.sqrt(),
            OpKind::Relu => x.max(0.0),
            OpKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            OpKind::Tanh => x.tanh(),
            _ => f64::NAN,
        })
        .collect();
    from_f64_vec(out, a.sizes(), dtype)
}

fn conv2d_op(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: [i64; 2],
    pad: [i64; 2],
    dilation: [i64; 2],
    groups: i64,
    out_sizes: &[i64],
    dtype: DType,
) -> Result<Tensor> {
    let x = to_f64_vec(input)?;
    let w = to_f64_vec(weight)?;
    let b = match bias {
        Some(t) => to_f64_vec(t)?,
        None => vec![0.0; out_sizes[1] as usize],
    };
    let (ih, iw) = (input.sizes()[2], input.sizes()[3]);
    let c_in = input.sizes()[1];
    let (kh, kw) = (weight.sizes()[2], weight.sizes()[3]);
    let in_per_group = weight.sizes()[1];
    let out_per_group = out_sizes[1] / groups;
    let (n_, co_, oh_, ow_) = (out_sizes[0], out_sizes[1], out_sizes[2], out_sizes[3]);
    let mut out = vec![0.0f64; numel(out_sizes).max(0) as usize];
    let x_strides = contiguous_strides(input.sizes());
    let w_strides = contiguous_strides(weight.sizes());
    let o_strides = contiguous_strides(out_sizes);
    for n in 0..n_ {
        for co in 0..co_ {
            let group = co / out_per_group;
            for oh in 0..oh_ {
                for ow in 0..ow_ {
                    let mut acc = b[co as usize];
                    for ci in 0..in_per_group {
                        let ic = group * in_per_group + ci;
                        debug_assert!(ic < c_in);
                        for fh in 0..kh {
                            for fw in 0..kw {
                                let y = oh * stride[0] - pad[0] + fh * dilation[0];
                                let z = ow * stride[1] - pad[1] + fw * dilation[1];
                                if y < 0 || y >= ih || z < 0 || z >= iw {
                                    continue;
                                }
                                let xi = n * x_strides[0]
                                    + ic * x_strides[1]
                                    + y * x_strides[2]
                                    + z * x_strides[3];
                                let wi = co * w_strides[0]
                                    + ci * w_strides[1]
                                    + fh * w_strides[2]
                                    + fw * w_strides[3];
                                acc += x[xi as usize] * w[wi as usize];
                            }
                        }
                    }
                    let oi =
                        n * o_strides[0] + co * o_strides[1] + oh * o_strides[2] + ow * o_strides[3];
                    out[oi as usize] = acc;
                }
            }
        }
    }
    from_f64_vec(out, out_sizes, dtype)
}

fn value_sizes(graph: &Graph, v: ValueId) -> Result<Vec<i64>> {
    graph
        .tensor_type(v)
        .and_then(|tt| tt.sizes.clone())
        .ok_or_else(|| {
            Error::malformed(format!(
                "fallback interpreter needs concrete sizes for '{}'",
                graph.value(v).name
            ))
        })
}

fn value_dtype(graph: &Graph, v: ValueId) -> DType {
    graph
        .tensor_type(v)
        .and_then(|tt| tt.dtype)
        .unwrap_or(DType::F32)
}

fn get_tensor<'a>(vals: &'a HashMap<ValueId, RtVal>, id: ValueId) -> Result<&'a Tensor> {
    match vals.get(&id) {
        Some(RtVal::Tensor(t)) => Ok(t),
        _ => Err(Error::malformed("fallback interpreter: missing tensor value")),
    }
}

fn get_int(vals: &HashMap<ValueId, RtVal>, id: ValueId) -> Result<i64> {
    match vals.get(&id) {
        Some(RtVal::Int(v)) => Ok(*v),
        _ => Err(Error::malformed("fallback interpreter: missing int value")),
    }
}

fn get_pair(vals: &HashMap<ValueId, RtVal>, id: ValueId) -> Result<[i64; 2]> {
    match vals.get(&id) {
        Some(RtVal::Int(v)) => Ok([*v, *v]),
        Some(RtVal::IntList(l)) if l.len() == 1 => Ok([l[0], l[0]]),
        Some(RtVal::IntList(l)) if l.len() == 2 => Ok([l[0], l[1]]),
        _ => Err(Error::malformed(
            "fallback interpreter: expected int or int pair",
        )),
    }
}

fn exec_node(
    graph: &Graph,
    node: &Node,
    vals: &mut HashMap<ValueId, RtVal>,
) -> Result<()> {
    let out0 = node.outputs[0];
    match &node.kind {
        OpKind::Constant(c) => {
            let v = match c {
                ConstantValue::Tensor(t) => RtVal::Tensor(t.clone()),
                ConstantValue::Double(v) => RtVal::Double(*v),
                ConstantValue::Int(v) => RtVal::Int(*v),
                ConstantValue::Bool(v) => RtVal::Bool(*v),
                ConstantValue::IntList(v) => RtVal::IntList(v.clone()),
                ConstantValue::DoubleList(v) => RtVal::DoubleList(v.clone()),
                ConstantValue::None => RtVal::None,
                ConstantValue::Custom(name) => {
                    return Err(Error::UnsupportedDtype(format!(
                        "fallback interpreter cannot evaluate custom class '{}'",
                        name
                    )))
                }
            };
            vals.insert(out0, v);
        }
        OpKind::ListConstruct => {
            let items: Vec<RtVal> = node
                .inputs
                .iter()
                .map(|id| vals.get(id).cloned().unwrap_or(RtVal::None))
                .collect();
            vals.insert(out0, RtVal::List(items));
        }
        OpKind::ConstantChunk { dim, chunks } => {
            let input = get_tensor(vals, node.inputs[0])?.clone();
            let dim = *dim as usize;
            let data = to_f64_vec(&input)?;
            let sizes = input.sizes().to_vec();
            let chunk_extent = sizes[dim] / chunks;
            for (k, &out_id) in node.outputs.iter().enumerate() {
                let out_sizes = value_sizes(graph, out_id)?;
                let n = numel(&out_sizes).max(0) as usize;
                let mut piece = Vec::with_capacity(n);
                let mut index = vec![0i64; out_sizes.len()];
                let strides = contiguous_strides(&sizes);
                for _ in 0..n {
                    let mut src = index.clone();
                    src[dim] += k as i64 * chunk_extent;
                    let off: i64 = src.iter().zip(strides.iter()).map(|(&i, &s)| i * s).sum();
                    piece.push(data[off as usize]);
                    odometer(&mut index, &out_sizes);
                }
                let t = from_f64_vec(piece, &out_sizes, value_dtype(graph, out_id))?;
                vals.insert(out_id, RtVal::Tensor(t));
            }
        }
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
            let a = get_tensor(vals, node.inputs[0])?;
            let b = get_tensor(vals, node.inputs[1])?;
            let sizes = value_sizes(graph, out0)?;
            let t = binary_op(&node.kind, a, b, &sizes, value_dtype(graph, out0))?;
            vals.insert(out0, RtVal::Tensor(t));
        }
        OpKind::Neg
        | OpKind::Abs
        | OpKind::Exp
        | OpKind::Log
        | OpKind::Sqrt
        | OpKind::Relu
        | OpKind::Sigmoid
        | OpKind::Tanh => {
            let a = get_tensor(vals, node.inputs[0])?;
            let t = unary_op(&node.kind, a, value_dtype(graph, out0))?;
            vals.insert(out0, RtVal::Tensor(t));
        }
        OpKind::To => {
            let a = get_tensor(vals, node.inputs[0])?;
            let data = to_f64_vec(a)?;
            let t = from_f64_vec(data, a.sizes(), value_dtype(graph, out0))?;
            vals.insert(out0, RtVal::Tensor(t));
        }
        OpKind::Sum => {
            let a = get_tensor(vals, node.inputs[0])?;
            let total: f64 = to_f64_vec(a)?.iter().sum();
            let t = from_f64_vec(vec![total], &[], value_dtype(graph, out0))?;
            vals.insert(out0, RtVal::Tensor(t));
        }
        OpKind::Conv2d => {
            let input = get_tensor(vals, node.inputs[0])?.clone();
            let weight = get_tensor(vals, node.inputs[1])?.clone();
            let bias = match vals.get(&node.inputs[2]) {
                Some(RtVal::Tensor(t)) => Some(t.clone()),
                _ => None,
            };
            let stride = get_pair(vals, node.inputs[3])?;
            let pad = get_pair(vals, node.inputs[4])?;
            let dilation = get_pair(vals, node.inputs[5])?;
            let groups = get_int(vals, node.inputs[6])?;
            let sizes = value_sizes(graph, out0)?;
            let t = conv2d_op(
                &input,
                &weight,
                bias.as_ref(),
                stride,
                pad,
                dilation,
                groups,
                &sizes,
                value_dtype(graph, out0),
            )?;
            vals.insert(out0, RtVal::Tensor(t));
        }
        OpKind::QuantizePerTensor => {
            let a = get_tensor(vals, node.inputs[0])?;
            let scale = match vals.get(&node.inputs[1]) {
                Some(RtVal::Double(v)) => *v,
                Some(RtVal::Tensor(t)) => t.item_f32()? as f64,
                _ => return Err(Error::malformed("quantize_per_tensor: bad scale")),
            };
            let zp = match vals.get(&node.inputs[2]) {
                Some(RtVal::Int(v)) => *v,
                Some(RtVal::Tensor(t)) => t.item_i64()?,
                _ => return Err(Error::malformed("quantize_per_tensor: bad zero_point")),
            };
            let data: Vec<f64> = to_f64_vec(a)?
                .into_iter()
                .map(|x| (x / scale).round() + zp as f64)
                .collect();
            let t = from_f64_vec(data, a.sizes(), value_dtype(graph, out0))?;
            vals.insert(out0, RtVal::Tensor(t));
        }
        OpKind::Cat => {
            let items = match vals.get(&node.inputs[0]) {
                Some(RtVal::List(items)) => items.clone(),
                _ => return Err(Error::malformed("cat expects a tensor list")),
            };
            let dim = get_int(vals, node.inputs[1])? as usize;
            let out_sizes = value_sizes(graph, out0)?;
            let n = numel(&out_sizes).max(0) as usize;
            let mut out = vec![0.0f64; n];
            let o_strides = contiguous_strides(&out_sizes);
            let mut offset = 0i64;
            for item in &items {
                let RtVal::Tensor(t) = item else {
                    return Err(Error::malformed("cat list element is not a tensor"));
                };
                let data = to_f64_vec(t)?;
                let sizes = t.sizes().to_vec();
                let mut index = vec![0i64; sizes.len()];
                for &x in &data {
                    let mut dst = index.clone();
                    dst[dim] += offset;
                    let oi: i64 = dst.iter().zip(o_strides.iter()).map(|(&i, &s)| i * s).sum();
                    out[oi as usize] = x;
                    odometer(&mut index, &sizes);
                }
                offset += sizes[dim];
            }
            let t = from_f64_vec(out, &out_sizes, value_dtype(graph, out0))?;
            vals.insert(out0, RtVal::Tensor(t));
        }
        OpKind::RandLike => {
            let a = get_tensor(vals, node.inputs[0])?;
            let n = a.numel().max(0) as usize;
            let data: Vec<f64> = (0..n).map(|_| rand::random::<f64>()).collect();
            let t = from_f64_vec(data, a.sizes(), value_dtype(graph, out0))?;
            vals.insert(out0, RtVal::Tensor(t));
        }
        OpKind::Matmul => {
            let a = get_tensor(vals, node.inputs[0])?;
            let b = get_tensor(vals, node.inputs[1])?;
            if a.rank() != 2 || b.rank() != 2 || a.sizes()[1] != b.sizes()[0] {
                return Err(Error::malformed("matmul expects compatible 2-d tensors"));
            }
            let (m, k, n) = (a.sizes()[0], a.sizes()[1], b.sizes()[1]);
            let av = to_f64_vec(a)?;
            let bv = to_f64_vec(b)?;
            let mut out = vec![0.0f64; (m * n).max(0) as usize];
            for i in 0..m {
                for j in 0..n {
                    let mut acc = 0.0;
                    for p in 0..k {
                        acc += av[(i * k + p) as usize] * bv[(p * n + j) as usize];
                    }
                    out[(i * n + j) as usize] = acc;
                }
            }
            let t = from_f64_vec(out, &[m, n], value_dtype(graph, out0))?;
            vals.insert(out0, RtVal::Tensor(t));
        }
    }
    Ok(())
}

/// Interpret the subgraph over the evaluation stack: consume the last
/// `n_inputs` stack values, execute every node, push one value per graph
/// output.
pub fn interpret_graph(graph: &Graph, stack: &mut Stack) -> Result<()> {
    let n_inputs = graph.inputs().len();
    if stack.len() < n_inputs {
        return Err(Error::malformed(format!(
            "stack holds {} values but the graph takes {} inputs",
            stack.len(),
            n_inputs
        )));
    }
    let args = stack.split_off(stack.len() - n_inputs);
    let mut vals: HashMap<ValueId, RtVal> = HashMap::new();
    for (&id, arg) in graph.inputs().iter().zip(args.into_iter()) {
        let v = match arg {
            StackValue::Tensor(t) => RtVal::Tensor(t),
            StackValue::Int(v) => RtVal::Int(v),
            StackValue::Double(v) => RtVal::Double(v),
            StackValue::Bool(v) => RtVal::Bool(v),
        };
        vals.insert(id, v);
    }
    for (_, node) in graph.nodes() {
        exec_node(graph, node, &mut vals)?;
    }
    for &out in graph.outputs() {
        match vals.get(&out) {
            Some(RtVal::Tensor(t)) => stack.push(StackValue::Tensor(t.clone())),
            Some(RtVal::Int(v)) => stack.push(StackValue::Int(*v)),
            Some(RtVal::Double(v)) => stack.push(StackValue::Double(*v)),
            Some(RtVal::Bool(v)) => stack.push(StackValue::Bool(*v)),
            _ => {
                return Err(Error::malformed(format!(
                    "fallback interpreter produced no value for output '{}'",
                    graph.value(out).name
                )))
            }
        }
    }
    Ok(())
}

use log::debug;
use vole_core::DType;
use vole_ir::{ConstantValue, Graph, Node, OpKind, ValueId};

// Fusability preflight — Predicates the upstream fuser consults before
// handing a node to the kernel
//
// These deliberately reject anything the lowerings cannot compile well,
// so unsupported shapes never reach compilation in the first place.

/// Concretely-known sizes and dtype of a tensor value, when complete.
/// A missing dtype defaults to f32.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub dims: Vec<i64>,
    pub dtype: DType,
}

/// Extract `TensorInfo` from a value with a complete tensor type.
pub fn tensor_info(graph: &Graph, v: ValueId) -> Option<TensorInfo> {
    let tt = graph.tensor_type(v)?;
    if !tt.is_complete() {
        return None;
    }
    Some(TensorInfo {
        dims: tt.sizes.clone()?,
        dtype: tt.dtype.unwrap_or(DType::F32),
    })
}

/// Read a constant int-or-int-list input as a pair, duplicating a bare
/// int into both positions.
fn pair_int(graph: &Graph, v: ValueId) -> Option<[i64; 2]> {
    let node = graph.producer(v)?;
    match node.constant_value()? {
        ConstantValue::Int(n) => Some([*n, *n]),
        ConstantValue::IntList(list) if list.len() == 2 => Some([list[0], list[1]]),
        ConstantValue::IntList(list) if list.len() == 1 => Some([list[0], list[0]]),
        _ => None,
    }
}

fn const_int(graph: &Graph, v: ValueId) -> Option<i64> {
    match graph.producer(v)?.constant_value()? {
        ConstantValue::Int(n) => Some(*n),
        _ => None,
    }
}

/// The kernel only supports conv2d with very specific properties:
/// - static shapes: 4-d input and filter, 1-d bias
/// - constant stride/padding/dilation/groups
/// - equal padding and stride, dilation == 1
/// - depthwise (groups == in channels == out channels)
/// - 3x3 kernel
pub fn conv2d_is_supported(graph: &Graph, node: &Node) -> bool {
    if node.kind != OpKind::Conv2d || node.inputs.len() < 7 {
        return false;
    }
    let input = tensor_info(graph, node.inputs[0]);
    let weight = tensor_info(graph, node.inputs[1]);
    let bias = tensor_info(graph, node.inputs[2]);
    let stride = pair_int(graph, node.inputs[3]);
    let pad = pair_int(graph, node.inputs[4]);
    let dilation = pair_int(graph, node.inputs[5]);
    let groups = const_int(graph, node.inputs[6]);

    // Everything should be statically known.
    let (Some(input), Some(weight), Some(bias), Some(stride), Some(pad), Some(dilation), Some(groups)) =
        (input, weight, bias, stride, pad, dilation, groups)
    else {
        debug!("conv2d_is_supported: some params aren't static");
        return false;
    };

    // All inputs should be contiguous so no transposition is required.
    if !graph.is_contiguous(node.inputs[0])
        || !graph.is_contiguous(node.inputs[1])
        || !graph.is_contiguous(node.inputs[2])
    {
        debug!("conv2d_is_supported: some inputs are not contiguous");
        return false;
    }

    if input.dims.len() != 4 || weight.dims.len() != 4 || bias.dims.len() != 1 {
        return false;
    }
    if stride[0] != stride[1] || pad[0] != pad[1] {
        return false;
    }
    if dilation != [1, 1] {
        return false;
    }
    // Depthwise with a 3x3 kernel.
    let (c_in, c_out) = (input.dims[1], weight.dims[0]);
    if groups != c_in || c_in != c_out {
        return false;
    }
    weight.dims[2] == 3 && weight.dims[3] == 3
}

/// The kernel currently only supports matmul of contiguous 2-D matrices
/// with static shapes.
pub fn matmul_is_supported(graph: &Graph, node: &Node) -> bool {
    if node.kind != OpKind::Matmul || node.inputs.len() < 2 {
        return false;
    }
    let (Some(a), Some(b)) = (
        tensor_info(graph, node.inputs[0]),
        tensor_info(graph, node.inputs[1]),
    ) else {
        debug!("matmul_is_supported: input shapes aren't static");
        return false;
    };
    if a.dims.len() != 2 || b.dims.len() != 2 {
        debug!("matmul_is_supported: unsupported input sizes");
        return false;
    }
    if !graph.is_contiguous(node.inputs[0]) || !graph.is_contiguous(node.inputs[1]) {
        debug!("matmul_is_supported: input shapes are not contiguous");
        return false;
    }
    true
}

use std::fmt;

use vole_core::{contiguous_strides, DType, Device, Tensor};

// Graph — Typed SSA dataflow region of tensor operations
//
// The graph is the contract between the upstream fuser (which decides what
// is worth compiling together) and the kernel (which compiles it). Values
// are typed; tensor types may be complete (concrete sizes, strides, dtype),
// symbolic (shape symbols with static rank), or bare. Nodes are kept in
// topological order by construction.

/// Index of a value in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

/// Index of a node in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// One dimension of a symbolic shape: either a concrete extent or an opaque
/// negative identifier bound to an integer graph input at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapeSym {
    Static(i64),
    /// Negative identifier of an unknown dimension.
    Dynamic(i64),
}

impl ShapeSym {
    pub fn is_static(&self) -> bool {
        matches!(self, ShapeSym::Static(_))
    }

    /// The concrete extent of a static symbol.
    pub fn static_size(&self) -> Option<i64> {
        match self {
            ShapeSym::Static(n) => Some(*n),
            ShapeSym::Dynamic(_) => None,
        }
    }

    /// The identifier of a dynamic symbol.
    pub fn sym_id(&self) -> Option<i64> {
        match self {
            ShapeSym::Static(_) => None,
            ShapeSym::Dynamic(id) => Some(*id),
        }
    }
}

/// Type information for a tensor-kinded value.
///
/// `symbolic_sizes` is the ordered sequence of shape symbols; `sizes` and
/// `strides` are the concrete layout when profiled. A tensor type is
/// *complete* when sizes, strides, and dtype are all present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorType {
    pub symbolic_sizes: Option<Vec<ShapeSym>>,
    pub sizes: Option<Vec<i64>>,
    pub strides: Option<Vec<i64>>,
    pub dtype: Option<DType>,
    pub device: Option<Device>,
}

impl TensorType {
    /// Fully-concrete tensor type with default contiguous strides.
    pub fn complete(sizes: Vec<i64>, dtype: DType, device: Device) -> TensorType {
        let strides = contiguous_strides(&sizes);
        TensorType::complete_strided(sizes, strides, dtype, device)
    }

    /// Fully-concrete tensor type with explicit strides.
    pub fn complete_strided(
        sizes: Vec<i64>,
        strides: Vec<i64>,
        dtype: DType,
        device: Device,
    ) -> TensorType {
        let symbolic = sizes.iter().map(|&s| ShapeSym::Static(s)).collect();
        TensorType {
            symbolic_sizes: Some(symbolic),
            sizes: Some(sizes),
            strides: Some(strides),
            dtype: Some(dtype),
            device: Some(device),
        }
    }

    /// Symbolic tensor type: known rank, possibly-dynamic extents, no
    /// concrete layout.
    pub fn symbolic(symbols: Vec<ShapeSym>, dtype: DType, device: Device) -> TensorType {
        TensorType {
            symbolic_sizes: Some(symbols),
            sizes: None,
            strides: None,
            dtype: Some(dtype),
            device: Some(device),
        }
    }

    /// Whether sizes, strides, and dtype are all concretely known.
    pub fn is_complete(&self) -> bool {
        self.sizes.is_some() && self.strides.is_some() && self.dtype.is_some()
    }

    /// Whether the concrete strides equal the default contiguous strides.
    /// False when the layout is not concretely known.
    pub fn is_contiguous(&self) -> bool {
        match (&self.sizes, &self.strides) {
            (Some(sizes), Some(strides)) => *strides == contiguous_strides(sizes),
            _ => false,
        }
    }
}

/// The type of an SSA value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    Tensor(TensorType),
    Float,
    Int,
    Bool,
    NoneType,
    /// Produced only by `ListConstruct` nodes; element types are the
    /// elements' own.
    List,
}

impl ValueType {
    pub fn as_tensor(&self) -> Option<&TensorType> {
        match self {
            ValueType::Tensor(tt) => Some(tt),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ValueType::Tensor(_) => "Tensor",
            ValueType::Float => "Float",
            ValueType::Int => "Int",
            ValueType::Bool => "Bool",
            ValueType::NoneType => "None",
            ValueType::List => "List",
        }
    }
}

/// Payload of a `Constant` node.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Tensor(Tensor),
    Double(f64),
    Int(i64),
    Bool(bool),
    IntList(Vec<i64>),
    DoubleList(Vec<f64>),
    None,
    /// An opaque custom-class payload; only backends that know the class can
    /// resolve it. The string is the class name.
    Custom(String),
}

/// Operator kind of a node.
///
/// The set is the operator surface the standard lowering library covers,
/// plus the structural kinds (`Constant`, `ListConstruct`, `ConstantChunk`)
/// the kernel handles itself.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Constant(ConstantValue),
    ListConstruct,
    /// Split the input into `chunks` equal pieces along `dim`; one output
    /// per piece.
    ConstantChunk { dim: i64, chunks: i64 },

    // Pointwise binary.
    Add,
    Sub,
    Mul,
    Div,

    // Pointwise unary.
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Relu,
    Sigmoid,
    Tanh,

    /// Dtype conversion; the target dtype is the output value's dtype.
    To,
    /// Full reduction to a 0-dim tensor.
    Sum,
    /// 2-D convolution: (input, weight, bias-or-none, stride, padding,
    /// dilation, groups).
    Conv2d,
    /// Affine quantization: (input, scale, zero_point, dtype).
    QuantizePerTensor,
    /// Concatenate a tensor list along a dimension: (list, dim).
    Cat,
    /// Tensor of the input's shape filled with uniform random values.
    RandLike,
    /// 2-D matrix product. Recognized by the fusability preflight; lowering
    /// is left to custom registries.
    Matmul,
}

impl OpKind {
    /// Stable operator name, the key of the custom lowering registry.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Constant(_) => "constant",
            OpKind::ListConstruct => "list_construct",
            OpKind::ConstantChunk { .. } => "constant_chunk",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Neg => "neg",
            OpKind::Abs => "abs",
            OpKind::Exp => "exp",
            OpKind::Log => "log",
            OpKind::Sqrt => "sqrt",
            OpKind::Relu => "relu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Tanh => "tanh",
            OpKind::To => "to",
            OpKind::Sum => "sum",
            OpKind::Conv2d => "conv2d",
            OpKind::QuantizePerTensor => "quantize_per_tensor",
            OpKind::Cat => "cat",
            OpKind::RandLike => "rand_like",
            OpKind::Matmul => "matmul",
        }
    }

    /// The operator's schema string, the key of the standard lowering
    /// registry. Structural kinds have no schema.
    pub fn schema(&self) -> Option<&'static str> {
        match self {
            OpKind::Constant(_) | OpKind::ListConstruct => None,
            OpKind::ConstantChunk { .. } => {
                Some("constant_chunk(Tensor self, int offset, int dim, int chunks) -> Tensor[]")
            }
            OpKind::Add => Some("add(Tensor self, Tensor other) -> Tensor"),
            OpKind::Sub => Some("sub(Tensor self, Tensor other) -> Tensor"),
            OpKind::Mul => Some("mul(Tensor self, Tensor other) -> Tensor"),
            OpKind::Div => Some("div(Tensor self, Tensor other) -> Tensor"),
            OpKind::Neg => Some("neg(Tensor self) -> Tensor"),
            OpKind::Abs => Some("abs(Tensor self) -> Tensor"),
            OpKind::Exp => Some("exp(Tensor self) -> Tensor"),
            OpKind::Log => Some("log(Tensor self) -> Tensor"),
            OpKind::Sqrt => Some("sqrt(Tensor self) -> Tensor"),
            OpKind::Relu => Some("relu(Tensor self) -> Tensor"),
            OpKind::Sigmoid => Some("sigmoid(Tensor self) -> Tensor"),
            OpKind::Tanh => Some("tanh(Tensor self) -> Tensor"),
            OpKind::To => Some("to(Tensor self, ScalarType dtype) -> Tensor"),
            OpKind::Sum => Some("sum(Tensor self) -> Tensor"),
            OpKind::Conv2d => Some(
                "conv2d(Tensor input, Tensor weight, Tensor? bias, int[2] stride, \
                 int[2] padding, int[2] dilation, int groups) -> Tensor",
            ),
            OpKind::QuantizePerTensor => Some(
                "quantize_per_tensor(Tensor self, float scale, int zero_point, \
                 ScalarType dtype) -> Tensor",
            ),
            OpKind::Cat => Some("cat(Tensor[] tensors, int dim) -> Tensor"),
            OpKind::RandLike => Some("rand_like(Tensor self) -> Tensor"),
            OpKind::Matmul => Some("matmul(Tensor self, Tensor other) -> Tensor"),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One operation in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: OpKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
}

impl Node {
    /// The constant payload, when this is a `Constant` node.
    pub fn constant_value(&self) -> Option<&ConstantValue> {
        match &self.kind {
            OpKind::Constant(v) => Some(v),
            _ => None,
        }
    }
}

/// One SSA value.
#[derive(Debug, Clone)]
pub struct Value {
    /// Debug name; the input binder sanitizes these into identifiers.
    pub name: String,
    pub ty: ValueType,
    /// The node producing this value and the output slot within it, if any
    /// (graph inputs have no producer).
    pub producer: Option<(NodeId, usize)>,
}

/// A dataflow subgraph of tensor operations, nodes in topological order.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub(crate) values: Vec<Value>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) inputs: Vec<ValueId>,
    pub(crate) outputs: Vec<ValueId>,
}

impl Graph {
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn inputs(&self) -> &[ValueId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ValueId] {
        &self.outputs
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// The node producing `id`, if it is not a graph input.
    pub fn producer(&self, id: ValueId) -> Option<&Node> {
        self.value(id).producer.map(|(nid, _)| self.node(nid))
    }

    /// The output slot of `id` within its producing node (0 for inputs).
    pub fn output_offset(&self, id: ValueId) -> usize {
        self.value(id).producer.map(|(_, off)| off).unwrap_or(0)
    }

    /// Whether any node consumes `id` or it is a graph output.
    pub fn has_uses(&self, id: ValueId) -> bool {
        self.outputs.contains(&id) || self.nodes.iter().any(|n| n.inputs.contains(&id))
    }

    /// The tensor type of `id`, failing the caller-friendly way when the
    /// value is not tensor-kinded.
    pub fn tensor_type(&self, id: ValueId) -> Option<&TensorType> {
        self.value(id).ty.as_tensor()
    }

    /// Whether `id` is a complete, default-contiguous tensor.
    pub fn is_contiguous(&self, id: ValueId) -> bool {
        self.tensor_type(id)
            .map(|tt| tt.is_complete() && tt.is_contiguous())
            .unwrap_or(false)
    }
}

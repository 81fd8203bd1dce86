use vole_core::{DType, Device};

use crate::graph::{
    ConstantValue, Graph, Node, NodeId, OpKind, ShapeSym, TensorType, Value, ValueId, ValueType,
};

// GraphBuilder — Programmatic construction of dataflow subgraphs
//
// Upstream producers (and tests) assemble graphs through this builder; the
// node list stays in insertion order, which doubles as topological order
// since every node may only reference previously created values.

#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_value(&mut self, name: impl Into<String>, ty: ValueType) -> ValueId {
        let id = ValueId(self.graph.values.len());
        self.graph.values.push(Value {
            name: name.into(),
            ty,
            producer: None,
        });
        id
    }

    /// Add a graph input of any type.
    pub fn input(&mut self, name: impl Into<String>, ty: ValueType) -> ValueId {
        let id = self.add_value(name, ty);
        self.graph.inputs.push(id);
        id
    }

    /// A complete contiguous tensor input.
    pub fn tensor_input(
        &mut self,
        name: impl Into<String>,
        sizes: &[i64],
        dtype: DType,
        device: Device,
    ) -> ValueId {
        self.input(
            name,
            ValueType::Tensor(TensorType::complete(sizes.to_vec(), dtype, device)),
        )
    }

    /// A complete tensor input with explicit strides.
    pub fn strided_tensor_input(
        &mut self,
        name: impl Into<String>,
        sizes: &[i64],
        strides: &[i64],
        dtype: DType,
        device: Device,
    ) -> ValueId {
        self.input(
            name,
            ValueType::Tensor(TensorType::complete_strided(
                sizes.to_vec(),
                strides.to_vec(),
                dtype,
                device,
            )),
        )
    }

    /// A tensor input with symbolic shape (static rank, dynamic extents).
    pub fn symbolic_tensor_input(
        &mut self,
        name: impl Into<String>,
        symbols: Vec<ShapeSym>,
        dtype: DType,
        device: Device,
    ) -> ValueId {
        self.input(
            name,
            ValueType::Tensor(TensorType::symbolic(symbols, dtype, device)),
        )
    }

    /// An integer scalar input (also used for symbolic-dim bindings).
    pub fn int_input(&mut self, name: impl Into<String>) -> ValueId {
        self.input(name, ValueType::Int)
    }

    pub fn float_input(&mut self, name: impl Into<String>) -> ValueId {
        self.input(name, ValueType::Float)
    }

    pub fn bool_input(&mut self, name: impl Into<String>) -> ValueId {
        self.input(name, ValueType::Bool)
    }

    /// Add a `Constant` node; the output type is derived from the payload.
    pub fn constant(&mut self, name: impl Into<String>, value: ConstantValue) -> ValueId {
        let ty = match &value {
            ConstantValue::Tensor(t) => ValueType::Tensor(TensorType::complete_strided(
                t.sizes().to_vec(),
                t.strides().to_vec(),
                t.dtype(),
                t.device(),
            )),
            ConstantValue::Double(_) => ValueType::Float,
            ConstantValue::Int(_) => ValueType::Int,
            ConstantValue::Bool(_) => ValueType::Bool,
            ConstantValue::IntList(_) | ConstantValue::DoubleList(_) => ValueType::List,
            ConstantValue::None => ValueType::NoneType,
            // Custom-class payloads present as tensors to their consumers.
            ConstantValue::Custom(_) => ValueType::Tensor(TensorType::default()),
        };
        self.node(OpKind::Constant(value), &[], ty, name)
    }

    /// Add a `ListConstruct` node over previously created values.
    pub fn list(&mut self, name: impl Into<String>, elements: &[ValueId]) -> ValueId {
        self.node(OpKind::ListConstruct, elements, ValueType::List, name)
    }

    /// Add a single-output node.
    pub fn node(
        &mut self,
        kind: OpKind,
        inputs: &[ValueId],
        output_ty: ValueType,
        name: impl Into<String>,
    ) -> ValueId {
        self.node_multi(kind, inputs, vec![(name.into(), output_ty)])[0]
    }

    /// Add a node with several outputs (e.g. `ConstantChunk`).
    pub fn node_multi(
        &mut self,
        kind: OpKind,
        inputs: &[ValueId],
        outputs: Vec<(String, ValueType)>,
    ) -> Vec<ValueId> {
        let node_id = NodeId(self.graph.nodes.len());
        let mut out_ids = Vec::with_capacity(outputs.len());
        for (slot, (name, ty)) in outputs.into_iter().enumerate() {
            let id = self.add_value(name, ty);
            self.graph.values[id.0].producer = Some((node_id, slot));
            out_ids.push(id);
        }
        self.graph.nodes.push(Node {
            kind,
            inputs: inputs.to_vec(),
            outputs: out_ids.clone(),
        });
        out_ids
    }

    /// The elementwise result type of combining two tensor values:
    /// broadcast sizes, promoted dtype, shared device.
    pub fn elementwise_type(&self, a: ValueId, b: ValueId) -> ValueType {
        let ta = self.graph.tensor_type(a);
        let tb = self.graph.tensor_type(b);
        match (ta, tb) {
            (Some(ta), Some(tb)) => {
                let sa = ta.sizes.clone().unwrap_or_default();
                let sb = tb.sizes.clone().unwrap_or_default();
                let sizes = broadcast_sizes(&sa, &sb);
                let dtype = match (ta.dtype, tb.dtype) {
                    (Some(da), Some(db)) => da.promote(db),
                    (Some(d), None) | (None, Some(d)) => d,
                    (None, None) => DType::F32,
                };
                let device = ta.device.or(tb.device).unwrap_or(Device::Cpu);
                ValueType::Tensor(TensorType::complete(sizes, dtype, device))
            }
            (Some(ta), None) => ValueType::Tensor(ta.clone()),
            (None, Some(tb)) => ValueType::Tensor(tb.clone()),
            (None, None) => ValueType::Float,
        }
    }

    /// Mark a value as a graph output.
    pub fn output(&mut self, id: ValueId) {
        self.graph.outputs.push(id);
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

/// Numpy-style broadcast of two size vectors; size-1 dims stretch.
fn broadcast_sizes(a: &[i64], b: &[i64]) -> Vec<i64> {
    let rank = a.len().max(b.len());
    let mut out = vec![0i64; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = da.max(db);
    }
    out
}

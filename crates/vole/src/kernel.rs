use std::alloc::Layout;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use log::debug;
use vole_core::{
    contiguous_strides, dense_non_overlapping, DType, Device, Error, Result, Tensor,
};
use vole_expr::loopnest::{buffer_map, has_reduction};
use vole_expr::{
    compute, Buf, BufferArg, CallArg, CodeGen, ComputeTensor, Expr, LoopNest, Stmt, Var,
};
use vole_ir::{ConstantValue, Graph, NodeId, OpKind, ShapeSym, TensorType, ValueId, ValueType};

use crate::backend::{create_codegen, infer_backend, BackendKind};
use crate::config::{fallback_allowed, fallback_enforced, CompileConfig};
use crate::interpreter::interpret_graph;
use crate::lowerings::{standard_lowerings, ArgValue, LoweringRegistry};
use crate::schedule;
use crate::stack::{Stack, StackValue};

// Kernel — The per-compilation pipeline object
//
// A Kernel owns everything produced while compiling one dataflow subgraph:
// the buffer and scalar bindings, the transformed statement tree, the
// codegen object, and the constant storage that must outlive it. All state
// is created during compilation and stays immutable through `run`; only
// `recompile` replaces the codegen object.
//
// Compilation is single-threaded and non-reentrant per kernel. Invocation
// is as thread-safe as the selected code generator.

/// Append the standard fuser hint to an error message.
pub fn fuser_error_message(msg: &str) -> String {
    const HINT: &str = "This error occurred in the fuser. Fusion can be disabled upstream.";
    if msg.is_empty() {
        return HINT.to_string();
    }
    if msg.ends_with('.') {
        format!("{} {}", msg, HINT)
    } else {
        format!("{}. {}", msg, HINT)
    }
}

/// The single device every tensor in the subgraph must live on.
pub fn pick_device_type(graph: &Graph) -> Result<Device> {
    let mut device: Option<Device> = None;
    let mut consider = |id: ValueId, graph: &Graph| -> Result<()> {
        if let Some(d) = graph.tensor_type(id).and_then(|tt| tt.device) {
            match device {
                Some(prev) if prev != d => {
                    return Err(Error::internal(fuser_error_message(
                        "different devices specified for inputs to the fuser",
                    )))
                }
                _ => device = Some(d),
            }
        }
        Ok(())
    };
    for (_, node) in graph.nodes() {
        for &inp in &node.inputs {
            consider(inp, graph)?;
        }
    }
    for &inp in graph.inputs() {
        consider(inp, graph)?;
    }
    device.ok_or_else(|| {
        Error::internal(fuser_error_message(
            "could not find device in fuser graph inputs",
        ))
    })
}

/// Turn a debug name into a variable-legal identifier.
fn sanitize_ident(name: &str) -> String {
    let mut s: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if s.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        s.insert(0, '_');
    }
    s
}

/// One bound constant: the buffer the kernel refers to it by, the raw data
/// pointer handed to codegen (null for custom-class payloads), and the
/// node a backend can use to resolve an opaque payload.
pub struct ConstantDescr {
    pub buf: Buf,
    pub ptr: *const u8,
    pub node: Option<NodeId>,
}

/// Host memory owned by the kernel for pre-allocated intermediates.
struct OwnedAlloc {
    ptr: *mut u8,
    layout: Layout,
}

impl Drop for OwnedAlloc {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }
}

/// Statistics from one compilation.
#[derive(Debug, Clone, Default)]
pub struct CompileStats {
    pub num_nodes: usize,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub num_constants: usize,
    pub num_intermediates: usize,
    pub compile_time_us: u64,
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Kernel: {} nodes, {} inputs, {} outputs, {} constants, {} intermediates, compiled in {}μs",
            self.num_nodes,
            self.num_inputs,
            self.num_outputs,
            self.num_constants,
            self.num_intermediates,
            self.compile_time_us,
        )
    }
}

pub struct Kernel {
    graph: Graph,
    config: CompileConfig,
    kernel_func_name: String,
    custom_lowerings: LoweringRegistry,
    std_lowerings: LoweringRegistry,
    symbolic_shape_inputs: Vec<i64>,
    pre_alloc: bool,

    device: Device,
    n_inputs: usize,
    has_symbolic_shapes: bool,
    input_name_map: HashMap<ValueId, String>,

    bufs: HashMap<ValueId, Buf>,
    scalars: HashMap<ValueId, Var>,
    shape_sym_to_var: HashMap<i64, Var>,
    shape_sym_input_pos: HashMap<Var, usize>,
    buffer_args: Vec<BufferArg>,
    buf_outputs: Vec<Buf>,

    constants: Vec<ConstantDescr>,
    unpacked_constant_tensors: Vec<Tensor>,
    prealloc_storage: Vec<OwnedAlloc>,

    tensor_output_sizes: Vec<Vec<i64>>,
    tensor_output_strides: Vec<Vec<i64>>,
    tensor_output_symbolic_sizes: Vec<Vec<Expr>>,
    tensor_output_dtypes: Vec<DType>,

    known_sizes: HashMap<ValueId, Vec<Expr>>,
    has_random: bool,
    has_broadcast: bool,

    stmt: Option<Stmt>,
    codegen: Option<Box<dyn CodeGen>>,
    allow_fallback: bool,
    use_fallback: bool,
    stats: CompileStats,
}

impl Kernel {
    /// Compile a subgraph. When fallback is allowed, compilation failures
    /// silently switch the kernel to the fallback path; otherwise they
    /// propagate.
    pub fn new(
        graph: Graph,
        kernel_func_name: impl Into<String>,
        custom_lowerings: LoweringRegistry,
        symbolic_shape_inputs: Vec<i64>,
        pre_alloc: bool,
        config: CompileConfig,
    ) -> Result<Kernel> {
        let std_lowerings = standard_lowerings(&config);
        let mut kernel = Kernel {
            graph,
            kernel_func_name: kernel_func_name.into(),
            custom_lowerings,
            std_lowerings,
            symbolic_shape_inputs,
            pre_alloc,
            device: Device::Cpu,
            n_inputs: 0,
            has_symbolic_shapes: false,
            input_name_map: HashMap::new(),
            bufs: HashMap::new(),
            scalars: HashMap::new(),
            shape_sym_to_var: HashMap::new(),
            shape_sym_input_pos: HashMap::new(),
            buffer_args: Vec::new(),
            buf_outputs: Vec::new(),
            constants: Vec::new(),
            unpacked_constant_tensors: Vec::new(),
            prealloc_storage: Vec::new(),
            tensor_output_sizes: Vec::new(),
            tensor_output_strides: Vec::new(),
            tensor_output_symbolic_sizes: Vec::new(),
            tensor_output_dtypes: Vec::new(),
            known_sizes: HashMap::new(),
            has_random: false,
            has_broadcast: false,
            stmt: None,
            codegen: None,
            allow_fallback: fallback_allowed(&config),
            use_fallback: false,
            stats: CompileStats::default(),
            config,
        };

        if !kernel.allow_fallback {
            kernel.compile()?;
            return Ok(kernel);
        }
        if fallback_enforced(&kernel.config) {
            kernel.use_fallback = true;
            return Ok(kernel);
        }
        if let Err(e) = kernel.compile() {
            debug!("kernel compilation failed, using fallback: {}", e);
            kernel.use_fallback = true;
        }
        Ok(kernel)
    }

    /// Whether this kernel executes through the fallback interpreter.
    pub fn uses_fallback(&self) -> bool {
        self.use_fallback
    }

    /// The final statement tree handed to codegen.
    pub fn scheduled_stmt(&self) -> Option<&Stmt> {
        self.stmt.as_ref()
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    /// The codegen argument order: inputs, symbolic-shape scalars,
    /// outputs, constants.
    pub fn buffer_args(&self) -> &[BufferArg] {
        &self.buffer_args
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Rebuild only the codegen object from the stored statement.
    pub fn recompile(&mut self) -> Result<()> {
        let stmt = self
            .stmt
            .clone()
            .ok_or_else(|| Error::internal("recompile called before compilation"))?;
        let backend = infer_backend(self.device, &self.config)?;
        self.codegen = Some(create_codegen(
            backend,
            stmt,
            self.buffer_args.clone(),
            self.device,
            self.kernel_func_name.clone(),
        )?);
        Ok(())
    }

    // ── Shape resolution ──

    /// The expression for one shape symbol: an immediate for static
    /// extents, a cached i64 variable `ss<|id|>` for dynamic ones.
    fn var_for_shape(&mut self, sym: ShapeSym) -> Expr {
        match sym {
            ShapeSym::Static(n) => Expr::long(n),
            ShapeSym::Dynamic(id) => {
                if let Some(var) = self.shape_sym_to_var.get(&id) {
                    return Expr::var(var);
                }
                let var = Var::new(format!("ss{}", id.abs()), DType::I64);
                self.shape_sym_to_var.insert(id, var.clone());
                Expr::var(&var)
            }
        }
    }

    fn sizes_from_symbolic_shape(&mut self, shape: &[ShapeSym]) -> Vec<Expr> {
        shape.iter().map(|&s| self.var_for_shape(s)).collect()
    }

    /// Per-dimension size expressions for a graph value.
    fn sizes_for_value(&mut self, v: ValueId) -> Result<Vec<Expr>> {
        if let Some(sizes) = self.known_sizes.get(&v) {
            return Ok(sizes.clone());
        }
        let ty = self.graph.value(v).ty.clone();
        match &ty {
            ValueType::Tensor(tt) => {
                if let Some(symbolic) = tt.symbolic_sizes.clone() {
                    return Ok(self.sizes_from_symbolic_shape(&symbolic));
                }
                if let Some(sizes) = &tt.sizes {
                    return Ok(sizes.iter().map(|&s| Expr::long(s)).collect());
                }
                Err(Error::malformed(format!(
                    "unknown sizes for value '{}' (kind {})",
                    self.graph.value(v).name,
                    self.graph
                        .producer(v)
                        .map(|n| n.kind.name())
                        .unwrap_or("input"),
                )))
            }
            ValueType::Float | ValueType::Int => Ok(vec![Expr::long(1)]),
            ValueType::NoneType => Ok(vec![]),
            other => Err(Error::malformed(format!(
                "unhandled node kind (in sizes_for_value): {}",
                other.kind_name()
            ))),
        }
    }

    fn dtype_for_value(&self, v: ValueId) -> Option<DType> {
        self.graph.tensor_type(v).and_then(|tt| tt.dtype)
    }

    // ── Input binding ──

    /// Sanitize input debug names into unique identifiers; collisions get
    /// trailing underscores.
    fn gen_input_debug_names(&mut self) {
        let mut taken: HashSet<String> = HashSet::new();
        for &input in self.graph.inputs() {
            let mut name = sanitize_ident(&self.graph.value(input).name);
            while taken.contains(&name) {
                name.push('_');
            }
            taken.insert(name.clone());
            self.input_name_map.insert(input, name);
        }
    }

    fn input_name(&self, v: ValueId) -> String {
        self.input_name_map
            .get(&v)
            .cloned()
            .unwrap_or_else(|| sanitize_ident(&self.graph.value(v).name))
    }

    /// Symbolic-shape tensor inputs must be contiguous; they bind to a
    /// buffer of symbolic dimension expressions.
    fn bind_symbolic_shape_input(&mut self, input: ValueId, name: &str) -> Result<Buf> {
        let tt = self
            .graph
            .tensor_type(input)
            .ok_or_else(|| Error::internal("symbolic input is not a tensor"))?
            .clone();
        let Some(symbolic) = tt.symbolic_sizes else {
            return Err(Error::constraint("symbolic shapes must have static ranks"));
        };
        let dims = self.sizes_from_symbolic_shape(&symbolic);
        let dtype = tt.dtype.unwrap_or(DType::F32);
        Ok(Buf::new(name, dims, dtype))
    }

    /// Bind one graph input; returns the restriding compute for
    /// non-contiguous tensors.
    fn bind_input(&mut self, input: ValueId) -> Result<ComputeTensor> {
        let ty = self.graph.value(input).ty.clone();
        match ty {
            ValueType::Tensor(tt) => {
                let name = format!("t{}", self.input_name(input));
                if !tt.is_complete() {
                    let buf = self.bind_symbolic_shape_input(input, &name)?;
                    self.bufs.insert(input, buf.clone());
                    self.buffer_args.push(BufferArg::Buf(buf));
                    return Ok(ComputeTensor::default());
                }
                let dtype = tt.dtype.unwrap_or(DType::F32);
                let sizes = tt.sizes.clone().unwrap_or_default();
                if tt.is_contiguous() {
                    let dims = sizes.iter().map(|&s| Expr::long(s)).collect();
                    let buf = Buf::new(name, dims, dtype);
                    self.bufs.insert(input, buf.clone());
                    self.buffer_args.push(BufferArg::Buf(buf));
                    return Ok(ComputeTensor::default());
                }
                // Non-contiguous input: a zero-sized placeholder carries
                // the raw data; a restriding compute normalizes it to the
                // contiguous logical shape everything downstream assumes.
                let strides = tt.strides.clone().unwrap_or_default();
                let placeholder = Buf::new(name, vec![Expr::long(0)], dtype);
                let dims: Vec<Expr> = sizes.iter().map(|&s| Expr::long(s)).collect();
                let restrided = compute(
                    format!("input_{}", self.bufs.len() + 1),
                    &dims,
                    dtype,
                    |axes| {
                        let mut idx = Expr::long(0);
                        for (axis, &stride) in axes.iter().zip(strides.iter()) {
                            idx = idx + axis.clone() * Expr::long(stride);
                        }
                        Ok(Expr::load(&placeholder, vec![idx]))
                    },
                )?;
                if let Some(buf) = &restrided.buf {
                    self.bufs.insert(input, buf.clone());
                }
                self.buffer_args.push(BufferArg::Buf(placeholder));
                Ok(restrided)
            }
            ValueType::Float => {
                self.bind_scalar_input(input, DType::F64);
                Ok(ComputeTensor::default())
            }
            ValueType::Bool => {
                self.bind_scalar_input(input, DType::Bool);
                Ok(ComputeTensor::default())
            }
            ValueType::Int => {
                self.bind_scalar_input(input, DType::I64);
                Ok(ComputeTensor::default())
            }
            other => Err(Error::UnsupportedDtype(format!(
                "cannot bind graph input of kind {}",
                other.kind_name()
            ))),
        }
    }

    fn bind_scalar_input(&mut self, input: ValueId, dtype: DType) {
        let var = Var::new(format!("v{}", self.input_name(input)), dtype);
        self.buffer_args.push(BufferArg::Var(var.clone()));
        self.scalars.insert(input, var);
    }

    /// Bind all graph inputs, with symbolic-shape scalar params processed
    /// first (their variables must exist before tensor dims reference
    /// them) but appended to the argument order last.
    fn bind_all_inputs(&mut self) -> Result<Vec<Stmt>> {
        let n_symbolic = self.symbolic_shape_inputs.len();
        if self.has_symbolic_shapes && self.n_inputs <= n_symbolic {
            return Err(Error::constraint(
                "symbolic dims not provided as inputs to the graph",
            ));
        }
        let sym_start = self.n_inputs - n_symbolic;
        let mut symbolic_args: Vec<BufferArg> = Vec::with_capacity(n_symbolic);
        if self.has_symbolic_shapes {
            for i in sym_start..self.n_inputs {
                let input = self.graph.inputs()[i];
                if self.graph.value(input).ty != ValueType::Int {
                    return Err(Error::constraint(
                        "expected integer type input to graph for symbolic dims",
                    ));
                }
                let var = Var::new(format!("v{}", self.input_name(input)), DType::I64);
                symbolic_args.push(BufferArg::Var(var.clone()));
                self.scalars.insert(input, var.clone());
                self.shape_sym_input_pos.insert(var, i);
            }
            for (i, &sym_id) in self.symbolic_shape_inputs.clone().iter().enumerate() {
                let input = self.graph.inputs()[sym_start + i];
                if let Some(var) = self.scalars.get(&input) {
                    self.shape_sym_to_var.insert(sym_id, var.clone());
                }
            }
        }

        let mut stmts = Vec::new();
        for i in 0..sym_start {
            let input = self.graph.inputs()[i];
            let bound = self.bind_input(input)?;
            if let Some(stmt) = bound.stmt {
                stmts.push(stmt);
            }
        }
        self.buffer_args.extend(symbolic_args);
        Ok(stmts)
    }

    // ── Constant binding ──

    fn bind_constant(&mut self, v: ValueId) -> Result<()> {
        let Some(node) = self.graph.producer(v) else {
            return Err(Error::internal("constant value has no producer node"));
        };
        let node_id = self.graph.value(v).producer.map(|(id, _)| id);
        let Some(value) = node.constant_value().cloned() else {
            return Err(Error::internal("bind_constant on a non-constant node"));
        };
        match value {
            ConstantValue::Custom(_) => {
                let name = format!("const_{}", sanitize_ident(&self.graph.value(v).name));
                let buf = Buf::new(name, vec![], DType::F32);
                self.constants.push(ConstantDescr {
                    buf: buf.clone(),
                    ptr: std::ptr::null(),
                    node: node_id,
                });
                self.bufs.insert(v, buf);
                Ok(())
            }
            ConstantValue::Tensor(tensor) => {
                let name = format!("const_{}", sanitize_ident(&self.graph.value(v).name));
                let dims = tensor.sizes().iter().map(|&s| Expr::long(s)).collect();
                let buf = Buf::new(name, dims, tensor.dtype());
                let ptr = if tensor.is_contiguous() {
                    // Point into the graph-owned tensor; the kernel owns
                    // the graph, so the pointer lives as long as we do.
                    match self.graph.producer(v).and_then(|n| n.constant_value()) {
                        Some(ConstantValue::Tensor(t)) => t.data_ptr(),
                        _ => std::ptr::null(),
                    }
                } else {
                    self.unpacked_constant_tensors
                        .push(tensor.clone_contiguous());
                    self.unpacked_constant_tensors
                        .last()
                        .map(|t| t.data_ptr())
                        .unwrap_or(std::ptr::null())
                };
                self.constants.push(ConstantDescr {
                    buf: buf.clone(),
                    ptr,
                    node: node_id,
                });
                self.bufs.insert(v, buf);
                Ok(())
            }
            // Scalar constants become immediates in the expression IR;
            // no binding needed.
            _ => Ok(()),
        }
    }

    // ── Argument conversion ──

    fn to_arg(&self, v: ValueId) -> Result<ArgValue> {
        if let Some(buf) = self.bufs.get(&v) {
            return Ok(ArgValue::Buf(buf.clone()));
        }
        if let Some(node) = self.graph.producer(v) {
            if node.kind == OpKind::ListConstruct {
                let mut items = Vec::with_capacity(node.inputs.len());
                for &el in &node.inputs {
                    items.push(self.to_arg(el)?);
                }
                if items.is_empty() {
                    return Ok(ArgValue::BufList(Vec::new()));
                }
                if items.iter().all(|a| matches!(a, ArgValue::Buf(_))) {
                    let bufs = items
                        .into_iter()
                        .filter_map(|a| match a {
                            ArgValue::Buf(b) => Some(b),
                            _ => None,
                        })
                        .collect();
                    return Ok(ArgValue::BufList(bufs));
                }
                if items.iter().all(|a| matches!(a, ArgValue::Int(_))) {
                    let ints = items.iter().filter_map(|a| a.as_int()).collect();
                    return Ok(ArgValue::IntList(ints));
                }
                return Err(Error::UnsupportedDtype(
                    "mixed-kind list argument".to_string(),
                ));
            }
            if let Some(value) = node.constant_value() {
                return match value {
                    ConstantValue::Double(x) => Ok(ArgValue::Double(*x)),
                    ConstantValue::Int(x) => Ok(ArgValue::Int(*x)),
                    ConstantValue::Bool(x) => Ok(ArgValue::Bool(*x)),
                    ConstantValue::None => Ok(ArgValue::None),
                    ConstantValue::IntList(x) => Ok(ArgValue::IntList(x.clone())),
                    ConstantValue::DoubleList(x) => Ok(ArgValue::DoubleList(x.clone())),
                    other => Err(Error::UnsupportedDtype(format!(
                        "constant kind {:?} has no argument form",
                        other
                    ))),
                };
            }
        }
        match self.scalars.get(&v) {
            Some(var) => Ok(ArgValue::Var(var.clone())),
            None => Err(Error::malformed(format!(
                "no scalar binding for value '{}'",
                self.graph.value(v).name
            ))),
        }
    }

    /// Unbox a 0-dim constant tensor of supported dtype into a scalar
    /// argument (quantization scale and zero-point positions).
    fn const_zero_dim_tensor_as_scalar(
        &self,
        v: ValueId,
        args: &mut Vec<ArgValue>,
    ) -> Result<bool> {
        let Some(node) = self.graph.producer(v) else {
            return Ok(false);
        };
        let Some(ConstantValue::Tensor(t)) = node.constant_value() else {
            return Ok(false);
        };
        if t.rank() != 0 {
            return Ok(false);
        }
        match t.dtype() {
            DType::F32 => {
                args.push(ArgValue::Double(t.item_f32()? as f64));
                Ok(true)
            }
            DType::I64 => {
                args.push(ArgValue::Int(t.item_i64()?));
                Ok(true)
            }
            other => Err(Error::UnsupportedDtype(format!(
                "unsupported tensor dtype {} for converting constant 0-dim tensor to scalar",
                other
            ))),
        }
    }

    // ── Lowering dispatch ──

    fn is_pointwise(kind: &OpKind) -> bool {
        matches!(
            kind,
            OpKind::Add
                | OpKind::Sub
                | OpKind::Mul
                | OpKind::Div
                | OpKind::Neg
                | OpKind::Abs
                | OpKind::Exp
                | OpKind::Log
                | OpKind::Sqrt
                | OpKind::Relu
                | OpKind::Sigmoid
                | OpKind::Tanh
        )
    }

    /// Compute one node output through the lowering registries.
    fn compute_value(&mut self, v: ValueId) -> Result<ComputeTensor> {
        let node = self
            .graph
            .producer(v)
            .ok_or_else(|| Error::malformed("value has no producer node"))?
            .clone();
        let op = node.kind.clone();

        if op == OpKind::RandLike {
            self.has_random = true;
        }
        if Self::is_pointwise(&op) {
            self.note_broadcast(&node.inputs, v);
        }

        let output_dtype = self.dtype_for_value(v);
        let output_shape = self.sizes_for_value(v)?;

        let mut args: Vec<ArgValue> = Vec::with_capacity(node.inputs.len() + 3);
        match &op {
            OpKind::ConstantChunk { dim, chunks } => {
                args.push(self.to_arg(node.inputs[0])?);
                args.push(ArgValue::Int(self.graph.output_offset(v) as i64));
                args.push(ArgValue::Int(*dim));
                args.push(ArgValue::Int(*chunks));
            }
            OpKind::To => {
                args.push(self.to_arg(node.inputs[0])?);
            }
            OpKind::QuantizePerTensor => {
                args.push(self.to_arg(node.inputs[0])?);
                if !self.const_zero_dim_tensor_as_scalar(node.inputs[1], &mut args)? {
                    args.push(self.to_arg(node.inputs[1])?);
                }
                if !self.const_zero_dim_tensor_as_scalar(node.inputs[2], &mut args)? {
                    args.push(self.to_arg(node.inputs[2])?);
                }
                args.push(self.to_arg(node.inputs[3])?);
            }
            OpKind::Conv2d => {
                for &inp in &node.inputs {
                    args.push(self.to_arg(inp)?);
                }
                if args[2].is_none() {
                    args[2] = self.synthesize_conv_bias(v, output_dtype, &output_shape)?;
                }
            }
            _ => {
                for &inp in &node.inputs {
                    args.push(self.to_arg(inp)?);
                }
            }
        }

        if let Some(lowering) = self.custom_lowerings.get(op.name()) {
            return lowering(&args, &output_shape, output_dtype, self.device);
        }
        if let Some(schema) = op.schema() {
            if let Some(lowering) = self.std_lowerings.get(schema) {
                return lowering(&args, &output_shape, output_dtype, self.device);
            }
        }
        Err(Error::UnsupportedSchema {
            kind: op.name().to_string(),
            schema: op.schema().unwrap_or("<no schema>").to_string(),
        })
    }

    /// Conv2d with a none bias gets a synthesized zero-bias constant of
    /// shape `[C_out]`.
    fn synthesize_conv_bias(
        &mut self,
        v: ValueId,
        output_dtype: Option<DType>,
        output_shape: &[Expr],
    ) -> Result<ArgValue> {
        let dtype = output_dtype.unwrap_or(DType::F32);
        let c_out = output_shape
            .get(1)
            .and_then(|e| e.as_long())
            .ok_or_else(|| Error::malformed("conv2d output channel count must be static"))?;
        let bias_tensor = Tensor::zeros(&[c_out], dtype, Device::Cpu);
        self.unpacked_constant_tensors.push(bias_tensor);
        let ptr = self
            .unpacked_constant_tensors
            .last()
            .map(|t| t.data_ptr())
            .unwrap_or(std::ptr::null());
        let buf = Buf::new(
            format!("conv2d_bias_opt_{}", sanitize_ident(&self.graph.value(v).name)),
            vec![Expr::long(c_out)],
            dtype,
        );
        self.constants.push(ConstantDescr {
            buf: buf.clone(),
            ptr,
            node: None,
        });
        Ok(ArgValue::Buf(buf))
    }

    /// Record broadcasting when a pointwise node's tensor operand shape
    /// differs from its output shape.
    fn note_broadcast(&mut self, inputs: &[ValueId], output: ValueId) {
        let Some(out_sizes) = self
            .graph
            .tensor_type(output)
            .and_then(|tt| tt.sizes.clone())
        else {
            return;
        };
        for &inp in inputs {
            if let Some(in_sizes) = self.graph.tensor_type(inp).and_then(|tt| tt.sizes.clone()) {
                if in_sizes != out_sizes {
                    self.has_broadcast = true;
                }
            }
        }
    }

    // ── Output restriding ──

    /// If the declared output strides differ from default contiguous (and
    /// the layout is dense and non-overlapping), emit a compute that
    /// permutes element positions so the linearly-written buffer reads
    /// back correctly under the target strides.
    fn convert_output_to_correct_strides(
        &mut self,
        v: ValueId,
        output_index: usize,
    ) -> Result<ComputeTensor> {
        let buf = self
            .bufs
            .get(&v)
            .cloned()
            .ok_or_else(|| {
                Error::internal(fuser_error_message(
                    "output tensor has no corresponding buffer in the fuser",
                ))
            })?;
        let tt = self
            .graph
            .tensor_type(v)
            .cloned()
            .unwrap_or_else(TensorType::default);
        let Some(sizes) = tt.sizes.clone() else {
            return Err(Error::malformed(format!(
                "shapes for output '{}' are unknown",
                self.graph.value(v).name
            )));
        };
        let default_strides = contiguous_strides(&sizes);
        let Some(strides) = tt.strides.clone() else {
            return Ok(ComputeTensor::buf_only(buf));
        };
        if strides == default_strides {
            return Ok(ComputeTensor::buf_only(buf));
        }
        // Without dense non-overlapping strides there is no permutation
        // of a contiguous buffer matching the declared layout.
        if !dense_non_overlapping(&sizes, &strides) {
            return Ok(ComputeTensor::buf_only(buf));
        }
        let dims = self.sizes_for_value(v)?;
        let dtype = tt.dtype.unwrap_or(DType::F32);
        compute(format!("output_{}", output_index), &dims, dtype, |axes| {
            let mut absolute = Expr::long(0);
            for (i, axis) in axes.iter().enumerate() {
                absolute = absolute + Expr::long(default_strides[i]) * axis.clone();
            }
            let mut order: Vec<usize> = (0..strides.len()).collect();
            order.sort_by(|&a, &b| strides[b].cmp(&strides[a]));
            let mut new_axes = vec![Expr::long(0); axes.len()];
            for &stride_index in &order {
                if sizes[stride_index] == 1 {
                    continue;
                }
                let stride = Expr::long(strides[stride_index]);
                new_axes[stride_index] = absolute.clone() / stride.clone();
                absolute = absolute % stride;
            }
            Ok(Expr::load(&buf, new_axes))
        })
    }

    // ── Compilation ──

    fn compile(&mut self) -> Result<()> {
        let started = Instant::now();
        self.device = pick_device_type(&self.graph)?;
        self.has_symbolic_shapes = !self.symbolic_shape_inputs.is_empty();
        self.n_inputs = self.graph.inputs().len();
        self.gen_input_debug_names();

        let mut block_stmts = self.bind_all_inputs()?;

        for (_, node) in self.graph.nodes().map(|(id, n)| (id, n.clone())).collect::<Vec<_>>() {
            match &node.kind {
                OpKind::ListConstruct => continue,
                OpKind::Constant(_) => {
                    self.bind_constant(node.outputs[0])?;
                    continue;
                }
                _ => {
                    for &output in &node.outputs {
                        if !self.graph.has_uses(output) {
                            continue;
                        }
                        let tensor = self.compute_value(output)?;
                        if let Some(buf) = &tensor.buf {
                            self.bufs.insert(output, buf.clone());
                        }
                        if let Some(stmt) = tensor.stmt {
                            block_stmts.push(stmt);
                        }
                    }
                }
            }
            if self.has_random && self.has_broadcast {
                return Err(Error::constraint(
                    "cannot support broadcast and random within one kernel",
                ));
            }
        }

        // Move output operands from `bufs` to `buf_outputs`.
        for (i, &output) in self.graph.outputs().to_vec().iter().enumerate() {
            if !self.bufs.contains_key(&output) {
                return Err(Error::malformed("cannot find output tensor"));
            }
            let tt = self
                .graph
                .tensor_type(output)
                .cloned()
                .ok_or_else(|| Error::malformed("graph output is not a tensor"))?;
            if self.has_symbolic_shapes {
                let symbolic = tt.symbolic_sizes.clone().ok_or_else(|| {
                    Error::constraint("symbolic shapes must have static ranks")
                })?;
                let sizes = self.sizes_from_symbolic_shape(&symbolic);
                self.tensor_output_symbolic_sizes.push(sizes);
            } else {
                // Internally everything is contiguous; only permute into
                // the declared strides at the very end of the kernel.
                let restrided = self.convert_output_to_correct_strides(output, i)?;
                if let Some(stmt) = restrided.stmt {
                    block_stmts.push(stmt);
                }
                if let Some(buf) = restrided.buf {
                    self.bufs.insert(output, buf);
                }
                let sizes = tt.sizes.clone().unwrap_or_default();
                let strides = match tt.strides.clone() {
                    Some(s) if dense_non_overlapping(&sizes, &s) => s,
                    _ => contiguous_strides(&sizes),
                };
                self.tensor_output_sizes.push(sizes);
                self.tensor_output_strides.push(strides);
            }
            let buf = self.bufs.remove(&output).ok_or_else(|| {
                Error::internal(fuser_error_message("missing output buffer"))
            })?;
            self.buf_outputs.push(buf.clone());
            self.buffer_args.push(BufferArg::Buf(buf));
            self.tensor_output_dtypes
                .push(tt.dtype.unwrap_or(DType::F32));
        }

        let backend = infer_backend(self.device, &self.config)?;
        let root = Stmt::Block(block_stmts);
        let stmt = self.transform_loops(backend, root)?;
        self.stmt = Some(stmt.clone());

        for c in &self.constants {
            self.buffer_args.push(BufferArg::Buf(c.buf.clone()));
        }
        if self.has_symbolic_shapes {
            self.tensor_output_sizes
                .resize(self.buf_outputs.len(), Vec::new());
            self.tensor_output_strides
                .resize(self.buf_outputs.len(), Vec::new());
        }

        self.codegen = Some(create_codegen(
            backend,
            stmt,
            self.buffer_args.clone(),
            self.device,
            self.kernel_func_name.clone(),
        )?);

        self.stats = CompileStats {
            num_nodes: self.graph.nodes().count(),
            num_inputs: self.n_inputs,
            num_outputs: self.buf_outputs.len(),
            num_constants: self.constants.len(),
            num_intermediates: self.stats.num_intermediates,
            compile_time_us: started.elapsed().as_micros() as u64,
        };
        debug!("{}", self.stats);
        Ok(())
    }

    // ── Loop transformation ──

    fn transform_loops(&mut self, backend: BackendKind, root: Stmt) -> Result<Stmt> {
        let mut nest = LoopNest::new(root, self.buf_outputs.clone());
        nest.sanitize_names();
        debug!("original stmt:\n{}", nest.root());

        let had_reduction = has_reduction(nest.root());

        // The block backend needs multi-dim extents recorded before
        // inlining erases intermediate structure.
        let block_buffer_dims = if backend == BackendKind::Block {
            Some(buffer_map(nest.root()))
        } else {
            None
        };

        nest.simplify();
        debug!("after simplify:\n{}", nest.root());

        // Inlining intermediate buffers can duplicate computation; CPU
        // codegen CSE recovers it once output loops are fused, and GPUs
        // have the arithmetic throughput to hide it.
        nest.inline_intermediate_bufs(true);
        debug!("after inline:\n{}", nest.root());

        // Must run after inlining (splitting breaks the inliner's
        // producer patterns) and before fusion (fusion can put several
        // conditionals into one loop, which this pass does not handle).
        if self.config.optimize_conditionals {
            nest.optimize_conditionals();
            debug!("after optimizing conditionals:\n{}", nest.root());
        }

        match backend {
            BackendKind::Llvm => {
                schedule::fuse_all_loops(nest.root_mut());
                debug!("after fuse:\n{}", nest.root());
                schedule::parallelize_outer_loops(&mut nest)?;
                debug!("after parallelize:\n{}", nest.root());
            }
            BackendKind::Cuda => {
                schedule::split_for_cuda(&mut nest, &self.config)?;
                debug!("after cuda split:\n{}", nest.root());
            }
            BackendKind::Block => {
                schedule::split_for_block(&mut nest, block_buffer_dims.unwrap_or_default())?;
                debug!("after block split:\n{}", nest.root());
            }
            BackendKind::SimpleIrEval => {}
        }

        let intermediates = nest.get_intermediate_bufs();
        self.stats.num_intermediates = intermediates.len();
        let to_allocate = if self.pre_alloc {
            self.pre_allocate_intermediate_bufs(&intermediates)
        } else {
            intermediates
        };
        nest.prepare_for_codegen(&to_allocate);
        debug!("after prepare_for_codegen:\n{}", nest.root());

        nest.simplify();
        if backend == BackendKind::Llvm && !had_reduction {
            nest.vectorize_inner_loops();
            debug!("after vectorization:\n{}", nest.root());
        }

        let stmt = vole_expr::simplify_stmt(&nest.into_root());
        debug!("final stmt:\n{}", stmt);
        Ok(stmt)
    }

    /// Allocate host memory for statically-sized intermediates; whatever
    /// cannot be sized or allocated here is left for codegen-time
    /// allocation.
    fn pre_allocate_intermediate_bufs(&mut self, intermediates: &[Buf]) -> Vec<Buf> {
        let mut remaining = Vec::new();
        for buf in intermediates {
            let Some(n) = buf.const_numel() else {
                remaining.push(buf.clone());
                continue;
            };
            let size = (n.max(0) as usize) * buf.dtype().size_in_bytes();
            let Ok(layout) = Layout::from_size_align(size.max(1), 64) else {
                remaining.push(buf.clone());
                continue;
            };
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                remaining.push(buf.clone());
                continue;
            }
            self.prealloc_storage.push(OwnedAlloc { ptr, layout });
            self.constants.push(ConstantDescr {
                buf: buf.clone(),
                ptr,
                node: None,
            });
        }
        remaining
    }

    // ── Invocation ──

    /// Run over the evaluation stack, honoring the fallback policy.
    pub fn run(&self, stack: &mut Stack) -> Result<()> {
        if !self.use_fallback && !self.allow_fallback {
            self.run_kernel(stack)
        } else if !self.use_fallback && self.allow_fallback {
            match self.run_kernel(stack) {
                Ok(()) => Ok(()),
                Err(e) => {
                    debug!("kernel call failed, falling back: {}", e);
                    interpret_graph(&self.graph, stack)
                }
            }
        } else {
            interpret_graph(&self.graph, stack)
        }
    }

    fn resolved_output_shapes(&self, inputs: &[StackValue]) -> Result<Vec<(Vec<i64>, Vec<i64>)>> {
        let mut shapes = Vec::with_capacity(self.buf_outputs.len());
        if self.has_symbolic_shapes {
            for symbolic in &self.tensor_output_symbolic_sizes {
                let mut sizes = Vec::with_capacity(symbolic.len());
                for dim in symbolic {
                    if let Some(n) = dim.as_long() {
                        sizes.push(n);
                        continue;
                    }
                    let var = dim.as_var().ok_or_else(|| {
                        Error::internal("symbolic output dim is neither const nor var")
                    })?;
                    let pos = *self.shape_sym_input_pos.get(var).ok_or_else(|| {
                        Error::internal("no input position recorded for shape symbol")
                    })?;
                    let value = inputs
                        .get(pos)
                        .and_then(|v| v.as_int())
                        .ok_or_else(|| {
                            Error::malformed("symbolic shape input is not an int")
                        })?;
                    sizes.push(value);
                }
                let strides = contiguous_strides(&sizes);
                shapes.push((sizes, strides));
            }
        } else {
            for (sizes, strides) in self
                .tensor_output_sizes
                .iter()
                .zip(self.tensor_output_strides.iter())
            {
                shapes.push((sizes.clone(), strides.clone()));
            }
        }
        Ok(shapes)
    }

    /// Marshal call arguments: input immediates and pointers, freshly
    /// allocated outputs, then constants in record order.
    fn prepare_run_args(
        &self,
        inputs: &[StackValue],
        outputs: &mut Vec<Tensor>,
    ) -> Result<Vec<CallArg>> {
        let mut run_args: Vec<CallArg> =
            Vec::with_capacity(inputs.len() + self.buf_outputs.len() + self.constants.len());
        for input in inputs {
            match input {
                StackValue::Int(v) => run_args.push(CallArg::Long(*v)),
                StackValue::Double(v) => run_args.push(CallArg::Double(*v)),
                StackValue::Bool(v) => run_args.push(CallArg::Bool(*v)),
                StackValue::Tensor(t) => {
                    run_args.push(CallArg::Ptr(t.data_ptr() as *mut u8))
                }
            }
        }
        let shapes = self.resolved_output_shapes(inputs)?;
        for (i, (sizes, strides)) in shapes.iter().enumerate() {
            let mut tensor = Tensor::empty_strided(
                sizes,
                strides,
                self.tensor_output_dtypes[i],
                self.device,
            )?;
            run_args.push(CallArg::Ptr(tensor.data_ptr_mut()));
            outputs.push(tensor);
        }
        for c in &self.constants {
            run_args.push(CallArg::Ptr(c.ptr as *mut u8));
        }
        Ok(run_args)
    }

    /// Invoke the compiled kernel over the stack. Errors propagate to the
    /// caller (which may divert to fallback).
    pub fn run_kernel(&self, stack: &mut Stack) -> Result<()> {
        let codegen = self
            .codegen
            .as_ref()
            .ok_or_else(|| Error::internal("run_kernel called without a compiled kernel"))?;
        if stack.len() < self.n_inputs {
            return Err(Error::malformed(format!(
                "stack holds {} values but the kernel takes {}",
                stack.len(),
                self.n_inputs
            )));
        }
        let split_at = stack.len() - self.n_inputs;
        let mut outputs: Vec<Tensor> = Vec::new();
        let run_args = self.prepare_run_args(&stack[split_at..], &mut outputs)?;
        codegen.call(&run_args)?;
        stack.truncate(split_at);
        for tensor in outputs {
            stack.push(StackValue::Tensor(tensor));
        }
        Ok(())
    }

    /// Invoke with pre-resolved raw pointers: no allocation, no stack.
    /// Only valid for kernels whose arguments are all tensors.
    pub fn run_fast(&self, inputs: &[*mut u8], outputs: &[*mut u8]) -> Result<()> {
        let codegen = self
            .codegen
            .as_ref()
            .ok_or_else(|| Error::internal("run_fast called without a compiled kernel"))?;
        let mut args: Vec<CallArg> =
            Vec::with_capacity(inputs.len() + outputs.len() + self.constants.len());
        args.extend(inputs.iter().map(|&p| CallArg::Ptr(p)));
        args.extend(outputs.iter().map(|&p| CallArg::Ptr(p)));
        for c in &self.constants {
            args.push(CallArg::Ptr(c.ptr as *mut u8));
        }
        codegen.call(&args)
    }
}

use vole_core::Tensor;

// Stack — The evaluation-stack calling convention
//
// The runtime invoker consumes the last `n_inputs` values from the stack
// (top of stack holds the last-pushed argument) and pushes one value per
// graph output in declared order.

/// One value on the evaluation stack.
#[derive(Debug, Clone)]
pub enum StackValue {
    Tensor(Tensor),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl StackValue {
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            StackValue::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StackValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// The evaluation stack.
pub type Stack = Vec<StackValue>;

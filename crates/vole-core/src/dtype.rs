use std::fmt;

// DType — Supported element data types
//
// Every buffer and tensor in the fuser carries a DType that determines its
// element size and numeric behavior. The set is the one the kernel can
// actually lower and execute:
//
//   F16  — 16-bit IEEE half float (block backend uses a 16-wide block)
//   F32  — 32-bit float, the default when a graph value omits its dtype
//   F64  — 64-bit float, the type of scalar `float` graph inputs
//   U8   — unsigned byte, quantized data (block backend uses a 32-wide block)
//   I64  — signed 64-bit int, the type of indices and scalar `int` inputs
//   Bool — logical values

/// Enum of all element data types the fuser handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    F32,
    F64,
    U8,
    I64,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::U8 => 1,
            DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Whether this dtype is an integral type (Bool counts).
    pub fn is_int(&self) -> bool {
        !self.is_float()
    }

    /// The dtype binary arithmetic promotes to when mixing `self` and `other`.
    ///
    /// Floats win over ints, wider wins over narrower. Bool promotes to
    /// whatever it is mixed with.
    pub fn promote(self, other: DType) -> DType {
        if self == other {
            return self;
        }
        let rank = |d: DType| match d {
            DType::Bool => 0,
            DType::U8 => 1,
            DType::I64 => 2,
            DType::F16 => 3,
            DType::F32 => 4,
            DType::F64 => 5,
        };
        if rank(self) >= rank(other) {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

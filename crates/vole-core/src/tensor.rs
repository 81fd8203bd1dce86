use half::f16;

use crate::device::Device;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::{contiguous_strides, numel};

// Tensor — Concrete dense tensor storage
//
// The fuser's runtime boundary deals in real memory: kernel inputs arrive as
// tensors, outputs are allocated here before the generated code writes into
// them, and tensor constants are owned by the kernel for its lifetime. This
// type is deliberately small — storage, sizes, strides, device — with no
// autograd and no operator library. The interesting math happens in the
// generated kernels, not here.
//
// Storage is an enum over typed Vecs rather than raw bytes so that element
// access is aligned and safe on the host side; code generators receive the
// base pointer via `data_ptr`.

/// Typed storage for one tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F16(_) => DType::F16,
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::U8(_) => DType::U8,
            TensorData::I64(_) => DType::I64,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F16(v) => v.len(),
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn zeroed(dtype: DType, len: usize) -> TensorData {
        match dtype {
            DType::F16 => TensorData::F16(vec![f16::ZERO; len]),
            DType::F32 => TensorData::F32(vec![0.0; len]),
            DType::F64 => TensorData::F64(vec![0.0; len]),
            DType::U8 => TensorData::U8(vec![0; len]),
            DType::I64 => TensorData::I64(vec![0; len]),
            DType::Bool => TensorData::Bool(vec![false; len]),
        }
    }

    fn base_ptr(&self) -> *const u8 {
        match self {
            TensorData::F16(v) => v.as_ptr() as *const u8,
            TensorData::F32(v) => v.as_ptr() as *const u8,
            TensorData::F64(v) => v.as_ptr() as *const u8,
            TensorData::U8(v) => v.as_ptr() as *const u8,
            TensorData::I64(v) => v.as_ptr() as *const u8,
            TensorData::Bool(v) => v.as_ptr() as *const u8,
        }
    }

    fn base_ptr_mut(&mut self) -> *mut u8 {
        match self {
            TensorData::F16(v) => v.as_mut_ptr() as *mut u8,
            TensorData::F32(v) => v.as_mut_ptr() as *mut u8,
            TensorData::F64(v) => v.as_mut_ptr() as *mut u8,
            TensorData::U8(v) => v.as_mut_ptr() as *mut u8,
            TensorData::I64(v) => v.as_mut_ptr() as *mut u8,
            TensorData::Bool(v) => v.as_mut_ptr() as *mut u8,
        }
    }
}

/// A dense tensor: typed storage plus sizes, strides, and a device tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
    sizes: Vec<i64>,
    strides: Vec<i64>,
    device: Device,
}

/// Storage elements required to back `sizes` under `strides`: one past the
/// largest reachable offset, or zero for empty tensors.
fn storage_span(sizes: &[i64], strides: &[i64]) -> usize {
    if sizes.iter().any(|&s| s == 0) {
        return 0;
    }
    let mut span = 1i64;
    for (&size, &stride) in sizes.iter().zip(strides.iter()) {
        span += (size - 1) * stride;
    }
    span as usize
}

impl Tensor {
    /// Allocate an uninitialized (zero-filled) tensor with explicit strides.
    ///
    /// This is the allocation entry point the runtime invoker uses for
    /// kernel outputs.
    pub fn empty_strided(
        sizes: &[i64],
        strides: &[i64],
        dtype: DType,
        device: Device,
    ) -> Result<Tensor> {
        if sizes.len() != strides.len() {
            return Err(Error::internal(format!(
                "rank mismatch in empty_strided: {} sizes vs {} strides",
                sizes.len(),
                strides.len()
            )));
        }
        let len = storage_span(sizes, strides);
        Ok(Tensor {
            data: TensorData::zeroed(dtype, len),
            sizes: sizes.to_vec(),
            strides: strides.to_vec(),
            device,
        })
    }

    /// A zero-filled contiguous tensor.
    pub fn zeros(sizes: &[i64], dtype: DType, device: Device) -> Tensor {
        let strides = contiguous_strides(sizes);
        let len = numel(sizes).max(0) as usize;
        Tensor {
            data: TensorData::zeroed(dtype, len),
            sizes: sizes.to_vec(),
            strides,
            device,
        }
    }

    /// Build a contiguous tensor from typed storage. The storage length must
    /// match the element count of `sizes`.
    pub fn from_data(data: TensorData, sizes: &[i64], device: Device) -> Result<Tensor> {
        let expected = numel(sizes).max(0) as usize;
        if data.len() != expected {
            return Err(Error::msg(format!(
                "element count mismatch: sizes {:?} require {} elements, got {}",
                sizes,
                expected,
                data.len()
            )));
        }
        let strides = contiguous_strides(sizes);
        Ok(Tensor {
            data,
            sizes: sizes.to_vec(),
            strides,
            device,
        })
    }

    /// Build a tensor with explicit strides over typed storage (for views
    /// and non-contiguous test inputs). The storage must cover the span the
    /// strides can reach.
    pub fn from_parts(
        data: TensorData,
        sizes: &[i64],
        strides: &[i64],
        device: Device,
    ) -> Result<Tensor> {
        if sizes.len() != strides.len() {
            return Err(Error::msg("rank mismatch between sizes and strides"));
        }
        let span = storage_span(sizes, strides);
        if data.len() < span {
            return Err(Error::msg(format!(
                "storage of {} elements cannot back span {}",
                data.len(),
                span
            )));
        }
        Ok(Tensor {
            data,
            sizes: sizes.to_vec(),
            strides: strides.to_vec(),
            device,
        })
    }

    pub fn from_f32(values: Vec<f32>, sizes: &[i64], device: Device) -> Result<Tensor> {
        Tensor::from_data(TensorData::F32(values), sizes, device)
    }

    pub fn from_f64(values: Vec<f64>, sizes: &[i64], device: Device) -> Result<Tensor> {
        Tensor::from_data(TensorData::F64(values), sizes, device)
    }

    pub fn from_i64(values: Vec<i64>, sizes: &[i64], device: Device) -> Result<Tensor> {
        Tensor::from_data(TensorData::I64(values), sizes, device)
    }

    /// A contiguous tensor with every element set to `value` (f32).
    pub fn full_f32(sizes: &[i64], value: f32, device: Device) -> Tensor {
        let len = numel(sizes).max(0) as usize;
        Tensor {
            data: TensorData::F32(vec![value; len]),
            sizes: sizes.to_vec(),
            strides: contiguous_strides(sizes),
            device,
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> i64 {
        numel(&self.sizes)
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    /// Whether the strides match the default contiguous strides.
    pub fn is_contiguous(&self) -> bool {
        self.strides == contiguous_strides(&self.sizes)
    }

    /// Base pointer of the storage, for handing to code generators.
    pub fn data_ptr(&self) -> *const u8 {
        self.data.base_ptr()
    }

    pub fn data_ptr_mut(&mut self) -> *mut u8 {
        self.data.base_ptr_mut()
    }

    /// Copy into a fresh tensor with default contiguous layout.
    pub fn clone_contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            return self.clone();
        }
        fn gather<T: Copy>(src: &[T], sizes: &[i64], strides: &[i64]) -> Vec<T> {
            let n = numel(sizes).max(0) as usize;
            let mut out = Vec::with_capacity(n);
            let mut index = vec![0i64; sizes.len()];
            for _ in 0..n {
                let offset: i64 = index
                    .iter()
                    .zip(strides.iter())
                    .map(|(&i, &s)| i * s)
                    .sum();
                out.push(src[offset as usize]);
                // Odometer increment, last dimension fastest.
                for d in (0..sizes.len()).rev() {
                    index[d] += 1;
                    if index[d] < sizes[d] {
                        break;
                    }
                    index[d] = 0;
                }
            }
            out
        }
        let data = match &self.data {
            TensorData::F16(v) => TensorData::F16(gather(v, &self.sizes, &self.strides)),
            TensorData::F32(v) => TensorData::F32(gather(v, &self.sizes, &self.strides)),
            TensorData::F64(v) => TensorData::F64(gather(v, &self.sizes, &self.strides)),
            TensorData::U8(v) => TensorData::U8(gather(v, &self.sizes, &self.strides)),
            TensorData::I64(v) => TensorData::I64(gather(v, &self.sizes, &self.strides)),
            TensorData::Bool(v) => TensorData::Bool(gather(v, &self.sizes, &self.strides)),
        };
        Tensor {
            data,
            sizes: self.sizes.clone(),
            strides: contiguous_strides(&self.sizes),
            device: self.device,
        }
    }

    /// The single element of a 0-dim (or one-element) f32 tensor.
    pub fn item_f32(&self) -> Result<f32> {
        match &self.data {
            TensorData::F32(v) if !v.is_empty() => Ok(v[0]),
            _ => Err(Error::msg(format!(
                "not a scalar f32 tensor: dtype {} with {} elements",
                self.dtype(),
                self.data.len()
            ))),
        }
    }

    /// The single element of a 0-dim (or one-element) i64 tensor.
    pub fn item_i64(&self) -> Result<i64> {
        match &self.data {
            TensorData::I64(v) if !v.is_empty() => Ok(v[0]),
            _ => Err(Error::msg(format!(
                "not a scalar i64 tensor: dtype {} with {} elements",
                self.dtype(),
                self.data.len()
            ))),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            TensorData::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::U8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_contiguous_transposed() {
        // A [2, 3] tensor viewed as its transpose [3, 2] via swapped strides.
        let data = TensorData::F32(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let t = Tensor::from_parts(data, &[3, 2], &[1, 3], Device::Cpu).unwrap();
        assert!(!t.is_contiguous());
        let c = t.clone_contiguous();
        assert!(c.is_contiguous());
        assert_eq!(c.as_f32().unwrap(), &[0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    }

    #[test]
    fn empty_strided_span() {
        let t = Tensor::empty_strided(&[2, 3], &[1, 2], DType::F32, Device::Cpu).unwrap();
        assert_eq!(t.numel(), 6);
        assert_eq!(t.as_f32().unwrap().len(), 6);
        let e = Tensor::empty_strided(&[0, 4], &[4, 1], DType::F32, Device::Cpu).unwrap();
        assert_eq!(e.numel(), 0);
        assert!(e.as_f32().unwrap().is_empty());
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::library::Status;

/// Parameter-free dtype tag, used wherever only the element kind matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DTypeEnum {
    Int8,
    Int32,
    Float16,
    Float32,
    QuantizedS8,
    QuantizedS32,
}

/// Element type of a tensor, carrying quantization parameters where applicable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DType {
    Int8,
    Int32,
    Float16,
    Float32,
    /// Signed 8-bit storage; the real value is `stored * scale`.
    QuantizedS8 { scale: f32 },
    /// Signed 32-bit storage, typically an accumulator; the real value is `stored * scale`.
    QuantizedS32 { scale: f32 },
}

impl DType {
    pub fn enumv(self) -> DTypeEnum {
        match self {
            DType::Int8 => DTypeEnum::Int8,
            DType::Int32 => DTypeEnum::Int32,
            DType::Float16 => DTypeEnum::Float16,
            DType::Float32 => DTypeEnum::Float32,
            DType::QuantizedS8 { .. } => DTypeEnum::QuantizedS8,
            DType::QuantizedS32 { .. } => DTypeEnum::QuantizedS32,
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Int8 | DType::QuantizedS8 { .. } => 1,
            DType::Float16 => 2,
            DType::Int32 | DType::Float32 | DType::QuantizedS32 { .. } => 4,
        }
    }

    /// Returns the quantization scale for quantized dtypes.
    pub fn scale(self) -> Option<f32> {
        match self {
            DType::QuantizedS8 { scale } | DType::QuantizedS32 { scale } => Some(scale),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::Int8 => f.write_str("Int8"),
            DType::Int32 => f.write_str("Int32"),
            DType::Float16 => f.write_str("Float16"),
            DType::Float32 => f.write_str("Float32"),
            DType::QuantizedS8 { scale } => write!(f, "QuantizedS8(scale={scale})"),
            DType::QuantizedS32 { scale } => write!(f, "QuantizedS32(scale={scale})"),
        }
    }
}

/// Shape, element strides and dtype of a tensor view.
///
/// Strides are expressed in elements, not bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorLayout {
    pub shape: Vec<usize>,
    pub strides: Vec<isize>,
    pub dtype: DType,
}

impl TensorLayout {
    /// Builds a row-major contiguous layout.
    pub fn contiguous(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        let shape = shape.into();
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            dtype,
        }
    }

    pub fn with_strides(
        shape: impl Into<Vec<usize>>,
        strides: impl Into<Vec<isize>>,
        dtype: DType,
    ) -> BackendResult<Self> {
        let shape = shape.into();
        let strides = strides.into();
        if shape.len() != strides.len() {
            return Err(BackendError::invalid_argument(format!(
                "layout rank mismatch: shape has {} dims, strides has {}",
                shape.len(),
                strides.len()
            )));
        }
        Ok(Self {
            shape,
            strides,
            dtype,
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    pub fn total_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// True when elements are densely packed in row-major order.
    ///
    /// Axes of extent 1 may carry any stride.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1isize;
        for (&extent, &stride) in self.shape.iter().zip(self.strides.iter()).rev() {
            if extent == 1 {
                continue;
            }
            if stride != expected {
                return false;
            }
            expected *= extent as isize;
        }
        true
    }

    /// Number of bytes between the lowest and one past the highest addressed element.
    pub fn span_bytes(&self) -> usize {
        if self.shape.iter().any(|&extent| extent == 0) {
            return 0;
        }
        let mut low = 0isize;
        let mut high = 0isize;
        for (&extent, &stride) in self.shape.iter().zip(self.strides.iter()) {
            let reach = (extent as isize - 1) * stride;
            if reach < 0 {
                low += reach;
            } else {
                high += reach;
            }
        }
        (high - low + 1) as usize * self.dtype.size_in_bytes()
    }

    /// Byte size of the tensor when stored densely.
    pub fn dense_bytes(&self) -> usize {
        self.total_elements() * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{{{:?}}} {}", self.shape, self.strides, self.dtype)
    }
}

pub fn contiguous_strides(shape: &[usize]) -> Vec<isize> {
    let mut strides = vec![0isize; shape.len()];
    let mut acc = 1isize;
    for (stride, &extent) in strides.iter_mut().zip(shape.iter()).rev() {
        *stride = acc;
        acc *= extent.max(1) as isize;
    }
    strides
}

/// Backend error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
    #[error("kernel {kernel} failed to launch: {status}")]
    KernelLaunch { kernel: String, status: Status },
}

impl BackendError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BackendError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_layout_is_contiguous() {
        let layout = TensorLayout::contiguous([2, 3, 4, 8], DType::QuantizedS8 { scale: 1.0 });
        assert_eq!(layout.strides, vec![96, 32, 8, 1]);
        assert!(layout.is_contiguous());
        assert_eq!(layout.span_bytes(), 192);
        assert_eq!(layout.dense_bytes(), 192);
    }

    #[test]
    fn padded_rows_are_not_contiguous() {
        let layout =
            TensorLayout::with_strides([2, 4, 4, 8], [160, 40, 10, 1], DType::Int8).unwrap();
        assert!(!layout.is_contiguous());
        assert_eq!(layout.span_bytes(), 160 + 3 * 40 + 3 * 10 + 7 + 1);
    }

    #[test]
    fn unit_extent_axes_ignore_stride() {
        let layout = TensorLayout::with_strides([1, 4, 8], [999, 8, 1], DType::Int8).unwrap();
        assert!(layout.is_contiguous());
    }
}

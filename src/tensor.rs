//! Logits tensor handle
//!
//! [`LogitsTensor`] is the crate's own numeric-array handle: a
//! contiguous row-major buffer plus a shape, with runtime element type.
//! The buffer adapter recognizes it out of the box and normalizes `f64`
//! storage to `f32` in place before masking, so callers can hand over
//! whatever their sampling pipeline produced and keep using the same
//! handle afterwards.

use serde::{Deserialize, Serialize};

use crate::error::{BozalError, Result};

/// Element type of a [`LogitsTensor`]'s storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit IEEE754 float (the native masking dtype)
    F32,
    /// 64-bit IEEE754 float (converted to `f32` before masking)
    F64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
        }
    }
}

/// Contiguous row-major logits buffer with a shape and runtime dtype
///
/// # Examples
///
/// ```
/// use bozal::tensor::{DType, LogitsTensor};
///
/// let t = LogitsTensor::from_f32(vec![1, 4], vec![0.1, 0.2, 0.3, 0.4]).unwrap();
/// assert_eq!(t.shape(), &[1, 4]);
/// assert_eq!(t.dtype(), DType::F32);
/// assert_eq!(t.row_len(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogitsTensor {
    data: TensorData,
    shape: Vec<usize>,
}

fn validate_shape(shape: &[usize], data_len: usize) -> Result<()> {
    if shape.is_empty() {
        return Err(BozalError::InvalidShape {
            reason: "shape cannot be empty".to_string(),
        });
    }
    if shape.contains(&0) {
        return Err(BozalError::InvalidShape {
            reason: "shape dimensions cannot be zero".to_string(),
        });
    }
    let expected: usize = shape.iter().product();
    if data_len != expected {
        return Err(BozalError::InvalidShape {
            reason: format!("shape {shape:?} expects {expected} elements, got {data_len}"),
        });
    }
    Ok(())
}

impl LogitsTensor {
    /// Create a tensor from `f32` data and a shape
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty, contains zero, or does not
    /// match the data length.
    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        validate_shape(&shape, data.len())?;
        Ok(Self {
            data: TensorData::F32(data),
            shape,
        })
    }

    /// Create a tensor from `f64` data and a shape
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty, contains zero, or does not
    /// match the data length.
    pub fn from_f64(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        validate_shape(&shape, data.len())?;
        Ok(Self {
            data: TensorData::F64(data),
            shape,
        })
    }

    /// Shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Length of the trailing dimension (one logit row)
    #[must_use]
    pub fn row_len(&self) -> usize {
        *self.shape.last().expect("shape validated non-empty")
    }

    /// Current element type
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
        }
    }

    /// Borrow the storage as `f32`, if it already is `f32`
    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            TensorData::F64(_) => None,
        }
    }

    /// Mutably borrow the storage as `f32`, if it already is `f32`
    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Some(v),
            TensorData::F64(_) => None,
        }
    }

    /// Normalize the storage to `f32` in place.
    ///
    /// Returns `true` if a converted copy was materialized, `false` if
    /// the storage was already `f32` (zero-copy). After this call
    /// [`as_f32_mut`](LogitsTensor::as_f32_mut) always returns `Some`.
    pub fn promote_to_f32(&mut self) -> bool {
        match &self.data {
            TensorData::F32(_) => false,
            TensorData::F64(v) => {
                let converted: Vec<f32> = v.iter().map(|&x| x as f32).collect();
                self.data = TensorData::F32(converted);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_f32_tensor() {
        let t = LogitsTensor::from_f32(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.ndim(), 2);
        assert_eq!(t.size(), 6);
        assert_eq!(t.row_len(), 3);
    }

    #[test]
    fn test_empty_shape_error() {
        let result = LogitsTensor::from_f32(vec![], vec![1.0, 2.0]);
        assert!(matches!(
            result.unwrap_err(),
            BozalError::InvalidShape { .. }
        ));
    }

    #[test]
    fn test_zero_dimension_error() {
        let result = LogitsTensor::from_f32(vec![2, 0], vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn test_size_mismatch_error() {
        let result = LogitsTensor::from_f64(vec![2, 3], vec![1.0, 2.0]);
        assert!(matches!(
            result.unwrap_err(),
            BozalError::InvalidShape { .. }
        ));
    }

    #[test]
    fn test_promote_f64_to_f32() {
        let mut t = LogitsTensor::from_f64(vec![3], vec![0.5, -1.25, 2.0]).unwrap();
        assert_eq!(t.dtype(), DType::F64);
        assert!(t.as_f32().is_none());

        assert!(t.promote_to_f32());
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(t.as_f32().unwrap(), &[0.5, -1.25, 2.0]);

        // Already f32: no copy
        assert!(!t.promote_to_f32());
    }

    #[test]
    fn test_serde_round_trip() {
        let t = LogitsTensor::from_f32(vec![2], vec![1.0, -1.0]).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: LogitsTensor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}

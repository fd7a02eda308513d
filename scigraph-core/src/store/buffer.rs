//! Array Buffers
//!
//! An [`ArrayBuffer`] is an N-dimensional, row-major array plus its
//! calibrations. The element storage sits behind an `Arc` so that snapshots
//! (undo entries, running computations) share it cheaply; writers go through
//! `Arc::make_mut`, which mutates in place when nobody else holds the
//! storage and copies otherwise.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{DocumentError, Result};
use crate::value::Region;

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    U8,
    U16,
    U32,
    I32,
    I64,
    F32,
    F64,
}

/// Typed element storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayValues {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

macro_rules! each_variant {
    ($values:expr, $v:ident => $body:expr) => {
        match $values {
            ArrayValues::U8($v) => $body,
            ArrayValues::U16($v) => $body,
            ArrayValues::U32($v) => $body,
            ArrayValues::I32($v) => $body,
            ArrayValues::I64($v) => $body,
            ArrayValues::F32($v) => $body,
            ArrayValues::F64($v) => $body,
        }
    };
}

impl ArrayValues {
    /// Element type.
    pub fn dtype(&self) -> DType {
        match self {
            Self::U8(_) => DType::U8,
            Self::U16(_) => DType::U16,
            Self::U32(_) => DType::U32,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        each_variant!(self, v => v.len())
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero-filled storage of the given type and length.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::U8 => Self::U8(vec![0; len]),
            DType::U16 => Self::U16(vec![0; len]),
            DType::U32 => Self::U32(vec![0; len]),
            DType::I32 => Self::I32(vec![0; len]),
            DType::I64 => Self::I64(vec![0; len]),
            DType::F32 => Self::F32(vec![0.0; len]),
            DType::F64 => Self::F64(vec![0.0; len]),
        }
    }

    /// Lossy conversion of every element to `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        each_variant!(self, v => v.iter().map(|x| *x as f64).collect())
    }

    /// Bit-level equality. Unlike `PartialEq`, `NaN` equals an identical `NaN`.
    pub fn bit_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::F32(a), Self::F32(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Self::F64(a), Self::F64(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => self == other,
        }
    }

    /// Overwrite with `other`, reusing the allocation when type and length match.
    pub(crate) fn copy_from(&mut self, other: &Self) {
        match (&mut *self, other) {
            (Self::U8(a), Self::U8(b)) if a.len() == b.len() => a.copy_from_slice(b),
            (Self::U16(a), Self::U16(b)) if a.len() == b.len() => a.copy_from_slice(b),
            (Self::U32(a), Self::U32(b)) if a.len() == b.len() => a.copy_from_slice(b),
            (Self::I32(a), Self::I32(b)) if a.len() == b.len() => a.copy_from_slice(b),
            (Self::I64(a), Self::I64(b)) if a.len() == b.len() => a.copy_from_slice(b),
            (Self::F32(a), Self::F32(b)) if a.len() == b.len() => a.copy_from_slice(b),
            (Self::F64(a), Self::F64(b)) if a.len() == b.len() => a.copy_from_slice(b),
            (this, other) => *this = other.clone(),
        }
    }

    fn gather(&self, indices: &[usize]) -> Self {
        match self {
            Self::U8(v) => Self::U8(indices.iter().map(|&i| v[i]).collect()),
            Self::U16(v) => Self::U16(indices.iter().map(|&i| v[i]).collect()),
            Self::U32(v) => Self::U32(indices.iter().map(|&i| v[i]).collect()),
            Self::I32(v) => Self::I32(indices.iter().map(|&i| v[i]).collect()),
            Self::I64(v) => Self::I64(indices.iter().map(|&i| v[i]).collect()),
            Self::F32(v) => Self::F32(indices.iter().map(|&i| v[i]).collect()),
            Self::F64(v) => Self::F64(indices.iter().map(|&i| v[i]).collect()),
        }
    }
}

/// Linear calibration mapping pixel coordinates or raw intensities to
/// physical units: `physical = offset + scale * raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub offset: f64,
    pub scale: f64,
    pub units: String,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            scale: 1.0,
            units: String::new(),
        }
    }
}

impl Calibration {
    pub fn new(offset: f64, scale: f64, units: impl Into<String>) -> Self {
        Self {
            offset,
            scale,
            units: units.into(),
        }
    }

    /// Convert a raw value to calibrated units.
    pub fn convert(&self, raw: f64) -> f64 {
        self.offset + self.scale * raw
    }
}

/// An N-dimensional array with calibrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayBuffer {
    shape: SmallVec<[usize; 4]>,
    values: Arc<ArrayValues>,
    dimensional_calibrations: Vec<Calibration>,
    intensity_calibration: Calibration,
}

impl ArrayBuffer {
    /// Create a buffer with default calibrations.
    ///
    /// Fails if the element count does not match the shape.
    pub fn new(shape: &[usize], values: ArrayValues) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(DocumentError::InvalidBuffer(format!(
                "shape {:?} needs {} elements, got {}",
                shape,
                expected,
                values.len()
            )));
        }
        Ok(Self {
            shape: SmallVec::from_slice(shape),
            values: Arc::new(values),
            dimensional_calibrations: vec![Calibration::default(); shape.len()],
            intensity_calibration: Calibration::default(),
        })
    }

    /// Zero-filled buffer.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let len = shape.iter().product();
        Self {
            shape: SmallVec::from_slice(shape),
            values: Arc::new(ArrayValues::zeros(dtype, len)),
            dimensional_calibrations: vec![Calibration::default(); shape.len()],
            intensity_calibration: Calibration::default(),
        }
    }

    /// One-dimensional `f64` buffer.
    pub fn from_f64(values: Vec<f64>) -> Self {
        let len = values.len();
        Self {
            shape: SmallVec::from_slice(&[len]),
            values: Arc::new(ArrayValues::F64(values)),
            dimensional_calibrations: vec![Calibration::default()],
            intensity_calibration: Calibration::default(),
        }
    }

    /// Replace the dimensional calibrations. One per dimension.
    pub fn with_dimensional_calibrations(mut self, calibrations: Vec<Calibration>) -> Result<Self> {
        if calibrations.len() != self.shape.len() {
            return Err(DocumentError::InvalidBuffer(format!(
                "{} calibrations for rank {}",
                calibrations.len(),
                self.shape.len()
            )));
        }
        self.dimensional_calibrations = calibrations;
        Ok(self)
    }

    /// Replace the intensity calibration.
    #[must_use]
    pub fn with_intensity_calibration(mut self, calibration: Calibration) -> Self {
        self.intensity_calibration = calibration;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    pub fn values(&self) -> &ArrayValues {
        &self.values
    }

    pub fn dimensional_calibrations(&self) -> &[Calibration] {
        &self.dimensional_calibrations
    }

    pub fn intensity_calibration(&self) -> &Calibration {
        &self.intensity_calibration
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `other` has the same shape and element type.
    pub fn same_layout(&self, other: &Self) -> bool {
        self.shape == other.shape && self.dtype() == other.dtype()
    }

    /// Whether the two buffers share element storage.
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.values, &other.values)
    }

    /// Bit-identical comparison of layout, values and calibrations.
    pub fn bit_eq(&self, other: &Self) -> bool {
        self.shape == other.shape
            && self.dimensional_calibrations == other.dimensional_calibrations
            && self.intensity_calibration == other.intensity_calibration
            && (self.shares_storage(other) || self.values.bit_eq(&other.values))
    }

    /// Mutable access to the elements, copying only if the storage is shared.
    pub(crate) fn values_mut(&mut self) -> &mut ArrayValues {
        Arc::make_mut(&mut self.values)
    }

    /// Mutate the elements with `f`, which must keep the element count and
    /// type. If it does not, the previous elements are put back.
    pub(crate) fn mutate_values<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ArrayValues),
    {
        let previous = Arc::clone(&self.values);
        let expected: usize = self.shape.iter().product();
        f(self.values_mut());
        if self.values.len() != expected || self.values.dtype() != previous.dtype() {
            let error = DocumentError::InvalidBuffer(format!(
                "mutation left {} {:?} elements for shape {:?}, needs {} {:?}",
                self.values.len(),
                self.values.dtype(),
                self.shape,
                expected,
                previous.dtype()
            ));
            self.values = previous;
            return Err(error);
        }
        Ok(())
    }

    /// Overwrite this buffer with `other`.
    ///
    /// Same layout and unshared storage: the elements are written into the
    /// existing allocation. Otherwise the storage is replaced.
    pub(crate) fn assign(&mut self, other: &ArrayBuffer) {
        let in_place = self.same_layout(other) && !self.shares_storage(other);
        match Arc::get_mut(&mut self.values) {
            Some(target) if in_place => target.copy_from(&other.values),
            // shared with a snapshot: adopt the new storage instead of copying twice
            _ => {
                self.shape = other.shape.clone();
                self.values = Arc::clone(&other.values);
            }
        }
        self.dimensional_calibrations = other.dimensional_calibrations.clone();
        self.intensity_calibration = other.intensity_calibration.clone();
    }

    /// Copy out the elements inside `region`.
    pub fn crop(&self, region: &Region) -> Result<ArrayBuffer> {
        region.validate_within(&self.shape)?;

        let rank = self.shape.len();
        let mut strides = vec![1usize; rank];
        for d in (0..rank.saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * self.shape[d + 1];
        }

        let count: usize = region.shape.iter().product();
        let mut indices = Vec::with_capacity(count);
        let mut cursor = vec![0usize; rank];
        for _ in 0..count {
            let flat: usize = cursor
                .iter()
                .zip(&region.origin)
                .zip(&strides)
                .map(|((c, o), s)| (c + o) * s)
                .sum();
            indices.push(flat);

            // odometer increment, last dimension fastest
            for d in (0..rank).rev() {
                cursor[d] += 1;
                if cursor[d] < region.shape[d] {
                    break;
                }
                cursor[d] = 0;
            }
        }

        let dimensional_calibrations = self
            .dimensional_calibrations
            .iter()
            .zip(&region.origin)
            .map(|(c, &o)| Calibration::new(c.convert(o as f64), c.scale, c.units.clone()))
            .collect();

        Ok(ArrayBuffer {
            shape: region.shape.clone(),
            values: Arc::new(self.values.gather(&indices)),
            dimensional_calibrations,
            intensity_calibration: self.intensity_calibration.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_must_match_values() {
        assert!(ArrayBuffer::new(&[2, 3], ArrayValues::U8(vec![0; 6])).is_ok());
        assert!(matches!(
            ArrayBuffer::new(&[2, 3], ArrayValues::U8(vec![0; 5])),
            Err(DocumentError::InvalidBuffer(_))
        ));
    }

    #[test]
    fn crop_2d() {
        let values: Vec<i32> = (0..12).collect();
        let buffer = ArrayBuffer::new(&[3, 4], ArrayValues::I32(values)).unwrap();
        let cropped = buffer.crop(&Region::new(&[1, 1], &[2, 2])).unwrap();
        assert_eq!(cropped.shape(), &[2, 2]);
        assert_eq!(cropped.values(), &ArrayValues::I32(vec![5, 6, 9, 10]));
    }

    #[test]
    fn crop_shifts_calibration_offset() {
        let buffer = ArrayBuffer::from_f64(vec![0.0; 10])
            .with_dimensional_calibrations(vec![Calibration::new(1.0, 0.5, "nm")])
            .unwrap();
        let cropped = buffer.crop(&Region::new(&[4], &[2])).unwrap();
        assert_eq!(cropped.dimensional_calibrations()[0].offset, 3.0);
        assert_eq!(cropped.dimensional_calibrations()[0].units, "nm");
    }

    #[test]
    fn assign_same_layout_reuses_unshared_storage() {
        let mut a = ArrayBuffer::from_f64(vec![1.0, 2.0]);
        let b = ArrayBuffer::from_f64(vec![3.0, 4.0]);
        let before = a.values() as *const ArrayValues;
        a.assign(&b);
        assert_eq!(a.values() as *const ArrayValues, before);
        assert_eq!(a.values(), &ArrayValues::F64(vec![3.0, 4.0]));
    }

    #[test]
    fn assign_shared_storage_copies_on_write() {
        let mut a = ArrayBuffer::from_f64(vec![1.0, 2.0]);
        let snapshot = a.clone();
        a.values_mut();
        assert!(!a.shares_storage(&snapshot));
        assert!(a.bit_eq(&snapshot));
    }

    #[test]
    fn assign_new_layout_replaces_storage() {
        let mut a = ArrayBuffer::from_f64(vec![1.0, 2.0]);
        let b = ArrayBuffer::zeros(&[2, 2], DType::U16);
        a.assign(&b);
        assert_eq!(a.shape(), &[2, 2]);
        assert_eq!(a.dtype(), DType::U16);
    }

    #[test]
    fn nan_is_bit_equal_to_itself() {
        let a = ArrayBuffer::from_f64(vec![f64::NAN]);
        let b = ArrayBuffer::from_f64(vec![f64::NAN]);
        assert!(a.bit_eq(&b));
    }
}

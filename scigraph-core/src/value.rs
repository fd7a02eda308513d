//! Scalar and region values.
//!
//! The same [`Value`] type is used for item metadata and for computation
//! parameters, which lets a connection copy one into the other unchanged.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{DocumentError, Result};

/// Metadata attached to a data item. Key order carries no meaning.
pub type Metadata = BTreeMap<String, Value>;

/// Parameter bindings of a computation.
pub type Parameters = BTreeMap<String, Value>;

/// A metadata or parameter value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    /// No value.
    #[default]
    Null,
    /// A boolean flag.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point scalar.
    Float(f64),
    /// A string.
    Text(String),
    /// A vector of floats (e.g. a line profile or calibration).
    Vector(Vec<f64>),
    /// A rectangular region in pixel coordinates.
    Region(Region),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view of the value, if it is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Region view of the value, if it is a region.
    pub fn as_region(&self) -> Option<&Region> {
        match self {
            Self::Region(r) => Some(r),
            _ => None,
        }
    }

    /// String view of the value, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

impl From<Region> for Value {
    fn from(v: Region) -> Self {
        Self::Region(v)
    }
}

/// A hyper-rectangle in pixel coordinates: `origin[d] .. origin[d] + shape[d]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    /// First pixel along each dimension.
    pub origin: SmallVec<[usize; 4]>,
    /// Extent along each dimension.
    pub shape: SmallVec<[usize; 4]>,
}

impl Region {
    /// Create a region from origin and shape.
    pub fn new(origin: &[usize], shape: &[usize]) -> Self {
        Self {
            origin: SmallVec::from_slice(origin),
            shape: SmallVec::from_slice(shape),
        }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Check that the region is non-empty and fits inside `bounds`.
    pub fn validate_within(&self, bounds: &[usize]) -> Result<()> {
        if self.origin.len() != self.shape.len() {
            return Err(DocumentError::InvalidRegion(format!(
                "origin rank {} does not match shape rank {}",
                self.origin.len(),
                self.shape.len()
            )));
        }
        if self.rank() != bounds.len() {
            return Err(DocumentError::InvalidRegion(format!(
                "region rank {} does not match buffer rank {}",
                self.rank(),
                bounds.len()
            )));
        }
        for (d, ((&o, &s), &b)) in self.origin.iter().zip(&self.shape).zip(bounds).enumerate() {
            if s == 0 || o.checked_add(s).map_or(true, |end| end > b) {
                return Err(DocumentError::InvalidRegion(format!(
                    "dimension {d}: {o}+{s} exceeds extent {b}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}+{:?}", self.origin.as_slice(), self.shape.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_within_bounds() {
        let region = Region::new(&[1, 2], &[3, 3]);
        assert!(region.validate_within(&[4, 5]).is_ok());
        assert!(region.validate_within(&[4, 4]).is_err());
        assert!(region.validate_within(&[4]).is_err());
    }

    #[test]
    fn empty_region_rejected() {
        let region = Region::new(&[0], &[0]);
        assert!(matches!(
            region.validate_within(&[8]),
            Err(DocumentError::InvalidRegion(_))
        ));
    }

    #[test]
    fn numeric_views() {
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::from(2.5).as_f64(), Some(2.5));
        assert_eq!(Value::from("x").as_f64(), None);
        assert_eq!(Value::from("x").as_str(), Some("x"));
    }
}

//! Data Item Store
//!
//! Arrays, their metadata, and the store that owns them.
//!
//! Items are kept in an identity-keyed table. Computations and connections
//! refer to items by [`DataItemId`] only, so the ownership graph stays a
//! tree even though the dependency graph between items and computations is
//! arbitrary (acyclic, but shared).

mod buffer;
mod data_store;
mod item;

pub use buffer::{ArrayBuffer, ArrayValues, Calibration, DType};
pub use data_store::{DataItemStore, ItemChange};
pub use item::{DataItem, DataItemId, ItemUpdate};

//! SciGraph Core
//!
//! This crate provides the live computation graph behind a scientific-imaging
//! document. It implements:
//!
//! - A store of data items (N-dimensional arrays with calibrations and metadata)
//! - A dependency graph of computations and connections with cycle rejection
//! - Incremental recompute to a fixed point, with stale-result discard
//! - Transactional undo/redo that re-enters the recompute pipeline
//! - Typed change notifications and a pluggable storage adapter
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `store`: Data items, array buffers and the item store
//! - `graph`: Computations, connections, the dependency graph and scheduler
//! - `compute`: Operation registry and the computation engine
//! - `undo`: Primitive mutation records and the transaction log
//! - `document`: The single mutation pipeline tying everything together
//! - `shared`: A thread-safe handle that runs computations on worker threads
//! - `storage`: The storage adapter contract and an in-memory adapter
//!
//! # Example
//!
//! ```rust
//! use scigraph_core::{
//!     ArrayBuffer, ComputationError, ComputationSpec, Document, DocumentConfig, Metadata,
//!     OperationInput, OperationOutput, OperationRegistry, Parameters,
//! };
//!
//! let registry = OperationRegistry::new().with(
//!     "negate",
//!     |inputs: &[OperationInput], _: &Parameters| -> Result<OperationOutput, ComputationError> {
//!         let values = inputs[0].buffer.values().to_f64_vec();
//!         Ok(OperationOutput::new(ArrayBuffer::from_f64(
//!             values.into_iter().map(|v| -v).collect(),
//!         )))
//!     },
//! );
//!
//! let mut doc = Document::new(DocumentConfig::default(), registry).unwrap();
//! let image = doc.create_item(ArrayBuffer::from_f64(vec![1.0, -2.0]), Metadata::new()).unwrap();
//! let negated = doc.add_computation(ComputationSpec::new("negate").input(image)).unwrap();
//!
//! let output = doc.computation(negated).unwrap().output();
//! assert_eq!(doc.item(output).unwrap().buffer().values().to_f64_vec(), vec![-1.0, 2.0]);
//! ```

pub mod compute;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod graph;
pub mod shared;
pub mod storage;
pub mod store;
pub mod undo;
pub mod value;

pub use compute::{
    CommitOutcome, ComputationEngine, Operation, OperationInput, OperationOutput,
    OperationRegistry, RunResult, RunTicket,
};
pub use config::{DocumentConfig, OutputRemovalPolicy};
pub use document::{Document, FlushFailure, FlushReport, SettleReport};
pub use error::{ComputationError, DocumentError, Result, StorageError};
pub use events::{DocumentEvent, EventBus, ListenerId};
pub use graph::{
    Computation, ComputationId, ComputationSpec, ComputationState, Connection, ConnectionId,
    ConnectionTarget, InputBinding, VersionVector,
};
pub use shared::SharedDocument;
pub use storage::{GraphManifest, MemoryStorage, StorageAdapter};
pub use store::{ArrayBuffer, ArrayValues, Calibration, DType, DataItem, DataItemId, ItemUpdate};
pub use undo::{Transaction, TransactionHandle};
pub use value::{Metadata, Parameters, Region, Value};

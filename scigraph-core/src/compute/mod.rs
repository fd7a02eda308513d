//! Computation execution.
//!
//! [`OperationRegistry`] maps operation identifiers to implementations and
//! [`ComputationEngine`] turns a computation into a self-contained
//! [`RunTicket`] that can execute anywhere.

mod engine;
mod operation;

pub use engine::{CommitOutcome, ComputationEngine, RunResult, RunTicket};
pub use operation::{Operation, OperationInput, OperationOutput, OperationRegistry};

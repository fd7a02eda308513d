//! Dependency Graph
//!
//! This module tracks which computations and connections read and write
//! which data items, and in what order they must run.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are data items, computations and connections
//! - Edges point from what is read to what reads it
//!
//! When an item changes, the [`RecomputeScheduler`] walks the graph to find
//! every processor downstream of it and orders them topologically. Cycles
//! are rejected when the offending edge is proposed, so the graph never
//! holds one.

mod computation;
mod connection;
mod dependency;
mod node;
mod scheduler;

pub use computation::{
    Computation, ComputationId, ComputationSpec, ComputationState, InputBinding, VersionVector,
};
pub use connection::{Connection, ConnectionId, ConnectionTarget};
pub use dependency::DependencyGraph;
pub use node::{Node, NodeRef};
pub use scheduler::RecomputeScheduler;

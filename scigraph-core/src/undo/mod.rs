//! Transactional undo/redo.

mod log;
mod primitive;

pub use log::{Transaction, TransactionHandle, TransactionLog};
pub use primitive::Primitive;

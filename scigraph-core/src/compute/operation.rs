//! Operations and the Operation Registry
//!
//! An operation is a pure function from input snapshots and parameters to
//! one output. The document never calls an operation by anything but its
//! registered identifier; a computation naming an unregistered identifier is
//! rejected with `UnknownOperation` before it enters the graph.
//!
//! Operations must be deterministic. The settle loop relies on it to reach
//! a fixed point.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{ComputationError, DocumentError, Result};
use crate::store::{ArrayBuffer, DataItemId};
use crate::value::{Metadata, Parameters, Value};

/// Read-only snapshot of one input, cropped to its binding's region.
#[derive(Debug, Clone)]
pub struct OperationInput {
    /// The item the snapshot was taken from.
    pub item: DataItemId,
    pub buffer: ArrayBuffer,
    pub metadata: Metadata,
}

/// Result of a successful operation.
#[derive(Debug, Clone)]
pub struct OperationOutput {
    pub buffer: ArrayBuffer,
    pub metadata: Metadata,
    /// Refined parameter values to write back to the computation.
    pub parameter_updates: Parameters,
}

impl OperationOutput {
    /// An output with no metadata.
    pub fn new(buffer: ArrayBuffer) -> Self {
        Self {
            buffer,
            metadata: Metadata::new(),
            parameter_updates: Parameters::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Report a refined parameter value.
    #[must_use]
    pub fn with_parameter_update(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.parameter_updates.insert(name.into(), value.into());
        self
    }
}

/// A named processing step.
pub trait Operation: Send + Sync {
    /// Compute the output from the inputs, in binding order.
    fn execute(
        &self,
        inputs: &[OperationInput],
        parameters: &Parameters,
    ) -> std::result::Result<OperationOutput, ComputationError>;
}

impl<F> Operation for F
where
    F: Fn(&[OperationInput], &Parameters) -> std::result::Result<OperationOutput, ComputationError>
        + Send
        + Sync,
{
    fn execute(
        &self,
        inputs: &[OperationInput],
        parameters: &Parameters,
    ) -> std::result::Result<OperationOutput, ComputationError> {
        self(inputs, parameters)
    }
}

/// Maps operation identifiers to implementations.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: IndexMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation, replacing any previous one with the same id.
    pub fn register(&mut self, id: impl Into<String>, operation: impl Operation + 'static) {
        self.operations.insert(id.into(), Arc::new(operation));
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, id: impl Into<String>, operation: impl Operation + 'static) -> Self {
        self.register(id, operation);
        self
    }

    /// Find an operation by id.
    pub fn lookup(&self, id: &str) -> Result<Arc<dyn Operation>> {
        self.operations
            .get(id)
            .cloned()
            .ok_or_else(|| DocumentError::UnknownOperation(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    /// Registered ids, in registration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(
        inputs: &[OperationInput],
        _: &Parameters,
    ) -> std::result::Result<OperationOutput, ComputationError> {
        let first = inputs.first().ok_or(ComputationError::InputCount {
            expected: 1,
            actual: 0,
        })?;
        Ok(OperationOutput::new(first.buffer.clone()))
    }

    #[test]
    fn lookup_registered_operation() {
        let registry = OperationRegistry::new().with("identity", identity);
        assert!(registry.contains("identity"));
        let op = registry.lookup("identity").unwrap();
        let input = OperationInput {
            item: DataItemId::from(1),
            buffer: ArrayBuffer::from_f64(vec![1.0, 2.0]),
            metadata: Metadata::new(),
        };
        let out = op.execute(&[input], &Parameters::new()).unwrap();
        assert_eq!(out.buffer.values().to_f64_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn unknown_operation_is_reported() {
        let registry = OperationRegistry::new();
        assert!(matches!(
            registry.lookup("fft"),
            Err(DocumentError::UnknownOperation(name)) if name == "fft"
        ));
    }

    #[test]
    fn ids_keep_registration_order() {
        let registry = OperationRegistry::new()
            .with("b", identity)
            .with("a", identity);
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(format!("{registry:?}"), r#"OperationRegistry { operations: ["b", "a"] }"#);
    }

    #[test]
    fn closures_are_operations() {
        let offset = 3.0;
        let registry = OperationRegistry::new().with(
            "offset",
            move |inputs: &[OperationInput],
                  _: &Parameters|
                  -> std::result::Result<OperationOutput, ComputationError> {
                let values: Vec<f64> = inputs[0]
                    .buffer
                    .values()
                    .to_f64_vec()
                    .into_iter()
                    .map(|v| v + offset)
                    .collect();
                Ok(OperationOutput::new(ArrayBuffer::from_f64(values)))
            },
        );
        let input = OperationInput {
            item: DataItemId::from(1),
            buffer: ArrayBuffer::from_f64(vec![1.0]),
            metadata: Metadata::new(),
        };
        let out = registry
            .lookup("offset")
            .unwrap()
            .execute(&[input], &Parameters::new())
            .unwrap();
        assert_eq!(out.buffer.values().to_f64_vec(), vec![4.0]);
    }
}

//! Computation Engine
//!
//! Running a computation is split in three steps so the middle one can
//! happen away from the document:
//!
//! 1. [`ComputationEngine::snapshot`] captures the operation, parameters,
//!    cropped input snapshots and the [`VersionVector`] they were taken at.
//! 2. [`RunTicket::execute`] calls the operation. It touches nothing but the
//!    ticket, so it can run on any thread.
//! 3. The document commits the [`RunResult`] only if its run is still the
//!    registered one and the version vector is still current; otherwise the
//!    result is stale and is discarded.
//!
//! Input snapshots share buffer storage with the store. An edit made while
//! a run is in flight copies the buffer instead of writing under the run.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{trace, warn};

use super::operation::{Operation, OperationInput, OperationOutput, OperationRegistry};
use crate::error::{ComputationError, DocumentError, Result};
use crate::graph::{Computation, ComputationId, VersionVector};
use crate::store::DataItemStore;
use crate::value::Parameters;

/// What happened to a run result handed back to the document.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The output was written. `output_changed` is false when the result was
    /// bit-identical to the previous output.
    Committed { output_changed: bool },

    /// The operation failed; the output keeps its last good value.
    Errored(ComputationError),

    /// The inputs or definition changed since the snapshot.
    Discarded,
}

/// Everything needed to run one computation off the document.
pub struct RunTicket {
    computation: ComputationId,
    run: u64,
    operation_id: String,
    version: VersionVector,
    operation: Arc<dyn Operation>,
    inputs: std::result::Result<Vec<OperationInput>, ComputationError>,
    parameters: Parameters,
}

impl RunTicket {
    pub fn computation(&self) -> ComputationId {
        self.computation
    }

    /// Serial the document assigned to this run. Zero for runs made
    /// directly on the engine.
    pub fn run(&self) -> u64 {
        self.run
    }

    pub(crate) fn with_run(mut self, run: u64) -> Self {
        self.run = run;
        self
    }

    /// Version vector the snapshot was taken at.
    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    /// Run the operation. Panics inside the operation are reported as
    /// failures of this computation.
    pub fn execute(self) -> RunResult {
        let Self {
            computation,
            run,
            operation_id,
            version,
            operation,
            inputs,
            parameters,
        } = self;

        let outcome = inputs.and_then(|inputs| {
            catch_unwind(AssertUnwindSafe(|| operation.execute(&inputs, &parameters)))
                .unwrap_or_else(|payload| {
                    Err(ComputationError::failed(format!(
                        "operation {operation_id} panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                })
        });

        if let Err(error) = &outcome {
            warn!(%computation, operation = %operation_id, %error, "operation failed");
        } else {
            trace!(%computation, operation = %operation_id, "operation finished");
        }

        RunResult {
            computation,
            run,
            version,
            outcome,
        }
    }
}

impl fmt::Debug for RunTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunTicket")
            .field("computation", &self.computation)
            .field("run", &self.run)
            .field("operation", &self.operation_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// The outcome of [`RunTicket::execute`], waiting to be committed.
#[derive(Debug)]
pub struct RunResult {
    pub computation: ComputationId,
    pub run: u64,
    pub version: VersionVector,
    pub outcome: std::result::Result<OperationOutput, ComputationError>,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Resolves operations and prepares runs.
#[derive(Debug, Clone, Default)]
pub struct ComputationEngine {
    registry: OperationRegistry,
}

impl ComputationEngine {
    pub fn new(registry: OperationRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// The vector `comp` would be computed from right now.
    pub fn current_version(comp: &Computation, store: &DataItemStore) -> Result<VersionVector> {
        let mut version = VersionVector {
            revision: comp.revision(),
            ..VersionVector::default()
        };
        for item in comp.input_items() {
            version.inputs.insert(item, store.counter(item)?);
        }
        Ok(version)
    }

    /// Capture what a run of `comp` needs.
    ///
    /// Fails only for structural problems (unknown operation, missing
    /// input). A region that does not fit its input is recorded in the
    /// ticket and surfaces as a failure of the run.
    pub fn snapshot(&self, comp: &Computation, store: &DataItemStore) -> Result<RunTicket> {
        let operation = self.registry.lookup(comp.operation())?;
        let version = Self::current_version(comp, store)?;

        let mut inputs = Vec::with_capacity(comp.inputs().len());
        let mut crop_error = None;
        for binding in comp.inputs() {
            let item = store.get(binding.item)?;
            let buffer = match &binding.region {
                None => item.buffer().clone(),
                Some(region) => match item.buffer().crop(region) {
                    Ok(cropped) => cropped,
                    Err(DocumentError::InvalidRegion(message)) => {
                        crop_error = Some(ComputationError::UnsupportedInput(format!(
                            "{}: {message}",
                            binding.item
                        )));
                        break;
                    }
                    Err(other) => return Err(other),
                },
            };
            inputs.push(OperationInput {
                item: binding.item,
                buffer,
                metadata: item.metadata().clone(),
            });
        }

        Ok(RunTicket {
            computation: comp.id(),
            run: 0,
            operation_id: comp.operation().to_string(),
            version,
            operation,
            inputs: match crop_error {
                Some(error) => Err(error),
                None => Ok(inputs),
            },
            parameters: comp.parameters().clone(),
        })
    }

    /// Snapshot and execute inline.
    pub fn run(&self, comp: &Computation, store: &DataItemStore) -> Result<RunResult> {
        Ok(self.snapshot(comp, store)?.execute())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InputBinding;
    use crate::store::{ArrayBuffer, ItemUpdate};
    use crate::value::{Metadata, Region};

    fn sum(
        inputs: &[OperationInput],
        _: &Parameters,
    ) -> std::result::Result<OperationOutput, ComputationError> {
        let total: f64 = inputs
            .iter()
            .flat_map(|i| i.buffer.values().to_f64_vec())
            .sum();
        Ok(OperationOutput::new(ArrayBuffer::from_f64(vec![total])))
    }

    fn setup() -> (ComputationEngine, DataItemStore, Computation) {
        let engine = ComputationEngine::new(
            OperationRegistry::new()
                .with("sum", sum)
                .with(
                    "panic",
                    |_: &[OperationInput],
                     _: &Parameters|
                     -> std::result::Result<OperationOutput, ComputationError> {
                        panic!("kaboom")
                    },
                ),
        );
        let mut store = DataItemStore::new();
        let a = store.create(ArrayBuffer::from_f64(vec![1.0, 2.0, 3.0]), Metadata::new());
        let out = store.create(ArrayBuffer::from_f64(vec![]), Metadata::new());
        let comp = Computation::new(
            ComputationId::from(1),
            "sum",
            vec![InputBinding::whole(a)],
            out,
            Parameters::new(),
        );
        (engine, store, comp)
    }

    #[test]
    fn run_is_deterministic() {
        let (engine, store, comp) = setup();
        let first = engine.run(&comp, &store).unwrap().outcome.unwrap();
        let second = engine.run(&comp, &store).unwrap().outcome.unwrap();
        assert!(first.buffer.bit_eq(&second.buffer));
        assert_eq!(first.buffer.values().to_f64_vec(), vec![6.0]);
    }

    #[test]
    fn snapshot_records_version_vector() {
        let (engine, mut store, comp) = setup();
        let input = comp.inputs()[0].item;
        let ticket = engine.snapshot(&comp, &store).unwrap();
        assert_eq!(ticket.version().revision, 1);
        assert_eq!(ticket.version().inputs.get(&input), Some(&1));

        store
            .update(input, ItemUpdate::buffer(ArrayBuffer::from_f64(vec![9.0, 9.0, 9.0])))
            .unwrap();
        let current = ComputationEngine::current_version(&comp, &store).unwrap();
        assert_ne!(&current, ticket.version());

        // the snapshot still sees the old values
        let result = ticket.execute();
        assert_eq!(result.outcome.unwrap().buffer.values().to_f64_vec(), vec![6.0]);
    }

    #[test]
    fn unknown_operation_fails_snapshot() {
        let (engine, store, comp) = setup();
        let bad = Computation::new(
            ComputationId::from(2),
            "nope",
            comp.inputs().to_vec(),
            comp.output(),
            Parameters::new(),
        );
        assert!(matches!(
            engine.snapshot(&bad, &store),
            Err(DocumentError::UnknownOperation(_))
        ));
    }

    #[test]
    fn panics_become_computation_errors() {
        let (engine, store, comp) = setup();
        let panicking = Computation::new(
            ComputationId::from(2),
            "panic",
            comp.inputs().to_vec(),
            comp.output(),
            Parameters::new(),
        );
        let result = engine.run(&panicking, &store).unwrap();
        match result.outcome {
            Err(ComputationError::Failed(message)) => assert!(message.contains("kaboom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn cropped_input_is_snapshotted() {
        let (engine, store, comp) = setup();
        let input = comp.inputs()[0].item;
        let cropped = Computation::new(
            ComputationId::from(2),
            "sum",
            vec![InputBinding::cropped(input, Region::new(&[1], &[2]))],
            comp.output(),
            Parameters::new(),
        );
        let out = engine.run(&cropped, &store).unwrap().outcome.unwrap();
        assert_eq!(out.buffer.values().to_f64_vec(), vec![5.0]);
    }

    #[test]
    fn out_of_bounds_region_fails_the_run() {
        let (engine, store, comp) = setup();
        let input = comp.inputs()[0].item;
        let cropped = Computation::new(
            ComputationId::from(2),
            "sum",
            vec![InputBinding::cropped(input, Region::new(&[2], &[5]))],
            comp.output(),
            Parameters::new(),
        );
        let result = engine.run(&cropped, &store).unwrap();
        assert!(matches!(
            result.outcome,
            Err(ComputationError::UnsupportedInput(_))
        ));
    }
}

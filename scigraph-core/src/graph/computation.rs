//! Computations
//!
//! A computation applies a named operation to its input items and writes
//! the result to its single output item. It carries the bookkeeping the
//! scheduler needs to decide whether it is up to date:
//!
//! - `revision` increases on every parameter edit or input rebinding.
//! - `computed_from` is the [`VersionVector`] of the last successful run.
//! - `attempted_from` is the vector of the last run, successful or not.
//!
//! A computation is dirty when `computed_from` differs from the current
//! vector, and needs a run when `attempted_from` does. The distinction keeps
//! an errored computation from being retried until something relevant
//! changes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ComputationError;
use crate::store::DataItemId;
use crate::value::{Parameters, Region, Value};

/// Stable identifier of a computation within a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComputationId(u64);

impl ComputationId {
    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ComputationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ComputationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "computation#{}", self.0)
    }
}

/// Lifecycle state of a computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputationState {
    /// Output matches the current inputs and parameters.
    Clean,

    /// Inputs or parameters changed since the last successful run.
    Dirty,

    /// A run is in flight.
    Running,

    /// The last run failed. The output holds the last good value.
    Errored,
}

/// One input of a computation: an item, optionally cropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    /// The item read.
    pub item: DataItemId,
    /// Crop applied to the item's buffer before the operation sees it.
    pub region: Option<Region>,
}

impl InputBinding {
    /// Bind the whole item.
    pub fn whole(item: DataItemId) -> Self {
        Self { item, region: None }
    }

    /// Bind a region of the item.
    pub fn cropped(item: DataItemId, region: Region) -> Self {
        Self {
            item,
            region: Some(region),
        }
    }
}

/// Modification counters of a computation's inputs plus its own revision.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionVector {
    /// Parameter/binding revision of the computation.
    pub revision: u64,
    /// Counter of every input item.
    pub inputs: BTreeMap<DataItemId, u64>,
}

/// Definition of a computation to be added to a document.
#[derive(Debug, Clone, Default)]
pub struct ComputationSpec {
    pub(crate) operation: String,
    pub(crate) inputs: Vec<InputBinding>,
    pub(crate) parameters: Parameters,
    pub(crate) output: Option<DataItemId>,
}

impl ComputationSpec {
    /// Start a definition for the given operation.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    /// Append a whole-item input.
    #[must_use]
    pub fn input(mut self, item: DataItemId) -> Self {
        self.inputs.push(InputBinding::whole(item));
        self
    }

    /// Append a cropped input.
    #[must_use]
    pub fn input_region(mut self, item: DataItemId, region: Region) -> Self {
        self.inputs.push(InputBinding::cropped(item, region));
        self
    }

    /// Set a parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Write into an existing item instead of creating a new one.
    #[must_use]
    pub fn output(mut self, item: DataItemId) -> Self {
        self.output = Some(item);
        self
    }
}

/// A computation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    id: ComputationId,
    operation: String,
    inputs: Vec<InputBinding>,
    output: DataItemId,
    parameters: Parameters,
    revision: u64,
    state: ComputationState,
    computed_from: Option<VersionVector>,
    attempted_from: Option<VersionVector>,
    last_error: Option<ComputationError>,
}

impl Computation {
    /// Create a computation that has never run. New computations start dirty.
    pub fn new(
        id: ComputationId,
        operation: impl Into<String>,
        inputs: Vec<InputBinding>,
        output: DataItemId,
        parameters: Parameters,
    ) -> Self {
        Self {
            id,
            operation: operation.into(),
            inputs,
            output,
            parameters,
            revision: 1,
            state: ComputationState::Dirty,
            computed_from: None,
            attempted_from: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> ComputationId {
        self.id
    }

    /// Identifier of the operation in the registry.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn inputs(&self) -> &[InputBinding] {
        &self.inputs
    }

    /// Distinct input items, in ascending order.
    pub fn input_items(&self) -> impl Iterator<Item = DataItemId> + '_ {
        let mut items: Vec<_> = self.inputs.iter().map(|b| b.item).collect();
        items.sort();
        items.dedup();
        items.into_iter()
    }

    pub fn output(&self) -> DataItemId {
        self.output
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn state(&self) -> ComputationState {
        self.state
    }

    pub fn computed_from(&self) -> Option<&VersionVector> {
        self.computed_from.as_ref()
    }

    pub fn attempted_from(&self) -> Option<&VersionVector> {
        self.attempted_from.as_ref()
    }

    /// The error of the last failed run, while errored.
    pub fn last_error(&self) -> Option<&ComputationError> {
        self.last_error.as_ref()
    }

    /// Whether the last successful run used exactly `current`.
    pub fn is_dirty(&self, current: &VersionVector) -> bool {
        self.computed_from.as_ref() != Some(current)
    }

    /// Whether no run, successful or not, has seen `current` yet.
    pub fn needs_run(&self, current: &VersionVector) -> bool {
        self.attempted_from.as_ref() != Some(current)
    }

    /// Set or replace a parameter. Returns `false` if the value was already set.
    pub(crate) fn set_parameter(&mut self, name: &str, value: Value) -> bool {
        if self.parameters.get(name) == Some(&value) {
            return false;
        }
        self.parameters.insert(name.to_string(), value);
        self.touch();
        true
    }

    pub(crate) fn set_inputs(&mut self, inputs: Vec<InputBinding>) {
        self.inputs = inputs;
        self.touch();
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.state = ComputationState::Dirty;
    }

    pub(crate) fn mark_clean(&mut self, version: VersionVector) {
        self.state = ComputationState::Clean;
        self.computed_from = Some(version.clone());
        self.attempted_from = Some(version);
        self.last_error = None;
    }

    pub(crate) fn mark_errored(&mut self, version: VersionVector, error: ComputationError) {
        self.state = ComputationState::Errored;
        self.attempted_from = Some(version);
        self.last_error = Some(error);
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.state = ComputationState::Dirty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(revision: u64, inputs: &[(u64, u64)]) -> VersionVector {
        VersionVector {
            revision,
            inputs: inputs
                .iter()
                .map(|&(item, counter)| (DataItemId::from(item), counter))
                .collect(),
        }
    }

    fn computation() -> Computation {
        Computation::new(
            ComputationId::from(1),
            "scale",
            vec![InputBinding::whole(DataItemId::from(1))],
            DataItemId::from(2),
            Parameters::new(),
        )
    }

    #[test]
    fn new_computation_is_dirty_and_needs_run() {
        let comp = computation();
        let current = vector(1, &[(1, 1)]);
        assert_eq!(comp.state(), ComputationState::Dirty);
        assert!(comp.is_dirty(&current));
        assert!(comp.needs_run(&current));
    }

    #[test]
    fn clean_after_success() {
        let mut comp = computation();
        let current = vector(1, &[(1, 1)]);
        comp.mark_clean(current.clone());
        assert_eq!(comp.state(), ComputationState::Clean);
        assert!(!comp.is_dirty(&current));
        assert!(comp.is_dirty(&vector(1, &[(1, 2)])));
    }

    #[test]
    fn errored_is_not_retried_until_inputs_change() {
        let mut comp = computation();
        let current = vector(1, &[(1, 1)]);
        comp.mark_errored(current.clone(), ComputationError::failed("boom"));
        assert_eq!(comp.state(), ComputationState::Errored);
        assert!(comp.is_dirty(&current));
        assert!(!comp.needs_run(&current));
        assert!(comp.needs_run(&vector(1, &[(1, 2)])));
    }

    #[test]
    fn parameter_edit_bumps_revision_once() {
        let mut comp = computation();
        comp.mark_clean(vector(1, &[(1, 1)]));
        assert!(comp.set_parameter("radius", Value::Float(2.0)));
        assert_eq!(comp.revision(), 2);
        assert_eq!(comp.state(), ComputationState::Dirty);
        assert!(!comp.set_parameter("radius", Value::Float(2.0)));
        assert_eq!(comp.revision(), 2);
    }

    #[test]
    fn input_items_are_distinct() {
        let comp = Computation::new(
            ComputationId::from(1),
            "subtract",
            vec![
                InputBinding::whole(DataItemId::from(3)),
                InputBinding::whole(DataItemId::from(1)),
                InputBinding::whole(DataItemId::from(3)),
            ],
            DataItemId::from(4),
            Parameters::new(),
        );
        let items: Vec<_> = comp.input_items().collect();
        assert_eq!(items, vec![DataItemId::from(1), DataItemId::from(3)]);
    }

    #[test]
    fn spec_builder_collects_bindings() {
        let spec = ComputationSpec::new("crop")
            .input_region(DataItemId::from(1), Region::new(&[0], &[2]))
            .param("sigma", 1.5);
        assert_eq!(spec.operation, "crop");
        assert_eq!(spec.inputs.len(), 1);
        assert!(spec.inputs[0].region.is_some());
        assert_eq!(spec.parameters.get("sigma"), Some(&Value::Float(1.5)));
        assert!(spec.output.is_none());
    }
}

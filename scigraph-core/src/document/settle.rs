//! Recompute: driving the graph to a fixed point.
//!
//! A settle repeatedly plans the processors downstream of the pending seeds
//! and brings each one up to date, in topological order:
//!
//! - a connection copies its source value to its target when they differ;
//! - a computation runs when its version vector has not been attempted yet.
//!
//! Whether a node needs processing is checked when its turn comes, not when
//! the plan is made, so a computation whose upstream output came out
//! bit-identical is skipped. Results are committed through the normal
//! pipeline; anything they change seeds the next pass. The settle ends when
//! a pass processes nothing.
//!
//! A node processed more than `max_recompute_rounds` times in one settle
//! means the graph is not converging, and the settle fails with
//! `RecomputeDivergence`.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, instrument, warn};

use super::history::Recording;
use super::Document;
use crate::compute::{CommitOutcome, ComputationEngine, RunResult, RunTicket};
use crate::error::{ComputationError, DocumentError, Result};
use crate::graph::{ComputationId, ComputationState, ConnectionId, ConnectionTarget, NodeRef};
use crate::undo::Primitive;
use crate::value::Value;

/// What a settle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettleReport {
    /// Planning passes (sequential settle) or waves (parallel settle).
    pub rounds: usize,
    /// Computation runs whose result was committed successfully.
    pub executed: usize,
    pub errored: usize,
    /// Results thrown away because their inputs changed mid-run.
    pub discarded: usize,
    pub connections_applied: usize,
}

impl SettleReport {
    pub(crate) fn tally(&mut self, outcome: &CommitOutcome) {
        match outcome {
            CommitOutcome::Committed { .. } => self.executed += 1,
            CommitOutcome::Errored(_) => self.errored += 1,
            CommitOutcome::Discarded => self.discarded += 1,
        }
    }
}

/// Runs a parallel settle may start at once, plus connections it applied
/// while preparing them.
#[derive(Debug, Default)]
pub(crate) struct Wave {
    pub tickets: Vec<RunTicket>,
    pub connections_applied: usize,
}

/// Per-settle execution counts backing the divergence guard.
#[derive(Debug, Default)]
pub(crate) struct ExecutionBudget {
    counts: HashMap<NodeRef, usize>,
}

impl ExecutionBudget {
    /// Count one execution of `node`. Fails once any node exceeds `limit`.
    fn spend(&mut self, node: NodeRef, limit: usize) -> bool {
        let count = self.counts.entry(node).or_insert(0);
        *count += 1;
        *count <= limit
    }

    pub(crate) fn rounds(&self) -> usize {
        self.counts.values().copied().max().unwrap_or(0)
    }
}

impl Document {
    /// Bring every computation up to date.
    ///
    /// Runs inline, one computation at a time. Queued events are delivered
    /// unless a transaction is open.
    #[instrument(skip(self), level = "debug")]
    pub fn settle(&mut self) -> Result<SettleReport> {
        self.ensure_open()?;
        let report = self.settle_inner();
        if !self.log.is_open() {
            self.events.flush();
        }
        report
    }

    pub(crate) fn settle_inner(&mut self) -> Result<SettleReport> {
        let mut report = SettleReport::default();
        let mut budget = ExecutionBudget::default();
        let limit = self.config.max_recompute_rounds;

        loop {
            self.absorb_changes();
            if !self.scheduler.has_pending() {
                break;
            }
            let plan = self.scheduler.take_plan(&self.graph);
            let mut processed = 0;

            for node in plan {
                if !self.needs_processing(node) {
                    continue;
                }
                if !budget.spend(node, limit) {
                    return Err(self.diverged(report.rounds + 1));
                }
                processed += 1;
                match node {
                    NodeRef::Computation(id) => {
                        let outcome = self.run_inline(id)?;
                        report.tally(&outcome);
                    }
                    NodeRef::Connection(id) => {
                        self.apply_connection(id)?;
                        report.connections_applied += 1;
                    }
                    NodeRef::Item(_) => {}
                }
            }

            if processed == 0 {
                break;
            }
            report.rounds += 1;
        }

        if report.rounds > 0 {
            info!(
                rounds = report.rounds,
                executed = report.executed,
                errored = report.errored,
                discarded = report.discarded,
                "settled"
            );
        }
        Ok(report)
    }

    /// Build the divergence error and drop the pending seeds.
    fn diverged(&mut self, rounds: usize) -> DocumentError {
        let pending = self
            .scheduler
            .plan(&self.graph)
            .into_iter()
            .chain(self.graph.computations().map(|c| NodeRef::Computation(c.id())))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|&node| self.needs_processing(node))
            .count();
        self.scheduler.clear();
        warn!(rounds, pending, "recompute diverged");
        DocumentError::RecomputeDivergence { rounds, pending }
    }

    /// Whether `node` is out of date and not already running.
    pub(crate) fn needs_processing(&self, node: NodeRef) -> bool {
        match node {
            NodeRef::Computation(id) => {
                if self.running.contains_key(&id) {
                    return false;
                }
                let Ok(comp) = self.graph.computation(id) else {
                    return false;
                };
                ComputationEngine::current_version(comp, &self.store)
                    .map(|version| comp.needs_run(&version))
                    .unwrap_or(false)
            }
            NodeRef::Connection(id) => self.connection_value(id).is_some(),
            NodeRef::Item(_) => false,
        }
    }

    /// The value a connection would write, if it differs from the target's.
    fn connection_value(&self, id: ConnectionId) -> Option<Value> {
        let conn = self.graph.connection(id).ok()?;
        let value = self
            .store
            .get(conn.source())
            .ok()?
            .metadata_value(conn.source_key())?;
        let current = match conn.target() {
            ConnectionTarget::Parameter { computation, name } => {
                self.graph.computation(*computation).ok()?.parameter(name)
            }
            ConnectionTarget::Metadata { item, key } => {
                self.store.get(*item).ok()?.metadata_value(key)
            }
        };
        (current != Some(value)).then(|| value.clone())
    }

    /// Copy a connection's source value to its target.
    pub(crate) fn apply_connection(&mut self, id: ConnectionId) -> Result<()> {
        let Some(value) = self.connection_value(id) else {
            return Ok(());
        };
        let target = self.graph.connection(id)?.target().clone();
        match target {
            ConnectionTarget::Parameter { computation, name } => {
                let before = self.graph.computation(computation)?.clone();
                let mut after = before.clone();
                after.set_parameter(&name, value);
                self.apply(Primitive::ModifyComputation { before, after }, Recording::Derived)?;
            }
            ConnectionTarget::Metadata { item, key } => {
                let before = self.store.get(item)?.clone();
                let mut metadata = before.metadata().clone();
                metadata.insert(key, value);
                let after = before.successor(before.buffer().clone(), metadata);
                self.apply(Primitive::ModifyItem { before, after }, Recording::Derived)?;
            }
        }
        debug!(connection = %id, "connection applied");
        Ok(())
    }

    /// Snapshot, execute and commit one computation on this thread.
    fn run_inline(&mut self, id: ComputationId) -> Result<CommitOutcome> {
        match self.start_run(id) {
            Ok(ticket) => self.commit_run_inner(ticket.execute()),
            Err(DocumentError::UnknownOperation(operation)) => {
                let error = ComputationError::failed(format!("unknown operation {operation}"));
                self.record_failure(id, error.clone())?;
                Ok(CommitOutcome::Errored(error))
            }
            Err(other) => Err(other),
        }
    }

    /// Start a run for a caller that executes it elsewhere.
    ///
    /// The computation reports `Running` until the result is handed to
    /// [`commit_run`](Self::commit_run). Useful for imposing timeouts: a run
    /// whose result is never committed can be abandoned with
    /// [`abandon_run`](Self::abandon_run).
    pub fn begin_run(&mut self, id: ComputationId) -> Result<RunTicket> {
        self.ensure_open()?;
        let ticket = self.start_run(id)?;
        if !self.log.is_open() {
            self.events.flush();
        }
        Ok(ticket)
    }

    /// Commit a run result if its inputs are still what it was computed
    /// from; otherwise discard it and reschedule the computation.
    pub fn commit_run(&mut self, result: RunResult) -> Result<CommitOutcome> {
        self.ensure_open()?;
        let outcome = self.commit_run_inner(result);
        if !self.log.is_open() {
            self.events.flush();
        }
        outcome
    }

    /// Forget an in-flight run and reschedule the computation.
    ///
    /// A result from the abandoned run is discarded if it comes back later.
    pub fn abandon_run(&mut self, id: ComputationId) {
        if let Some(run) = self.running.remove(&id) {
            self.scheduler.invalidate_node(NodeRef::Computation(id));
            debug!(computation = %id, run, "run abandoned");
        }
    }

    /// Abandon every run in flight.
    ///
    /// Undo, redo and cancel put modification counters back, so a later
    /// edit can reach the same version vector with different data.
    pub(crate) fn abandon_all_runs(&mut self) {
        let ids: Vec<ComputationId> = self.running.keys().copied().collect();
        for id in ids {
            self.abandon_run(id);
        }
    }

    /// Mark the computation dirty, snapshot it and register it as running.
    pub(crate) fn start_run(&mut self, id: ComputationId) -> Result<RunTicket> {
        let comp = self.graph.computation(id)?;
        let ticket = self.engine.snapshot(comp, &self.store)?;
        self.mark_dirty(id)?;
        self.next_run += 1;
        self.running.insert(id, self.next_run);
        Ok(ticket.with_run(self.next_run))
    }

    fn mark_dirty(&mut self, id: ComputationId) -> Result<()> {
        let before = self.graph.computation(id)?.clone();
        if before.state() == ComputationState::Dirty {
            return Ok(());
        }
        let mut after = before.clone();
        after.mark_dirty();
        self.apply(Primitive::ModifyComputation { before, after }, Recording::Derived)
    }

    /// Record a failure that happened before the operation could run.
    fn record_failure(&mut self, id: ComputationId, error: ComputationError) -> Result<()> {
        let before = self.graph.computation(id)?.clone();
        let version = ComputationEngine::current_version(&before, &self.store)?;
        let mut after = before.clone();
        after.mark_errored(version, error);
        self.apply(Primitive::ModifyComputation { before, after }, Recording::Derived)
    }

    pub(crate) fn commit_run_inner(&mut self, result: RunResult) -> Result<CommitOutcome> {
        let id = result.computation;
        if self.running.get(&id) != Some(&result.run) {
            debug!(computation = %id, run = result.run, "result for abandoned run dropped");
            return Ok(CommitOutcome::Discarded);
        }
        self.running.remove(&id);
        let committed = self.commit_registered(result);
        if committed.is_err() {
            self.scheduler.invalidate_node(NodeRef::Computation(id));
        }
        committed
    }

    fn commit_registered(&mut self, result: RunResult) -> Result<CommitOutcome> {
        let RunResult {
            computation: id,
            version,
            outcome,
            ..
        } = result;

        let Ok(comp) = self.graph.computation(id) else {
            debug!(computation = %id, "result for removed computation dropped");
            return Ok(CommitOutcome::Discarded);
        };
        let current = ComputationEngine::current_version(comp, &self.store).ok();
        if current.as_ref() != Some(&version) {
            debug!(computation = %id, "stale result discarded");
            self.scheduler.invalidate_node(NodeRef::Computation(id));
            return Ok(CommitOutcome::Discarded);
        }
        let before = comp.clone();

        match outcome {
            Ok(output) => {
                let item = self.store.get(before.output())?;
                let mut metadata = item.metadata().clone();
                metadata.extend(output.metadata);
                let output_changed =
                    !item.buffer().bit_eq(&output.buffer) || &metadata != item.metadata();
                if output_changed {
                    let previous = item.clone();
                    let next = previous.successor(output.buffer, metadata);
                    self.apply(
                        Primitive::ModifyItem {
                            before: previous,
                            after: next,
                        },
                        Recording::Derived,
                    )?;
                }

                let mut after = before.clone();
                after.mark_clean(version);
                for (name, value) in output.parameter_updates {
                    after.set_parameter(&name, value);
                }
                self.apply(Primitive::ModifyComputation { before, after }, Recording::Derived)?;
                debug!(computation = %id, output_changed, "result committed");
                Ok(CommitOutcome::Committed { output_changed })
            }
            Err(error) => {
                let mut after = before.clone();
                after.mark_errored(version, error.clone());
                self.apply(Primitive::ModifyComputation { before, after }, Recording::Derived)?;
                warn!(computation = %id, %error, "computation errored");
                Ok(CommitOutcome::Errored(error))
            }
        }
    }

    /// Plan the next wave for a parallel settle.
    ///
    /// Connections are applied on the spot. A computation is started only
    /// when nothing upstream of it is pending or running; the rest stay
    /// seeded for a later wave.
    ///
    /// On failure every run already started for the wave is abandoned.
    pub(crate) fn prepare_wave(&mut self, budget: &mut ExecutionBudget) -> Result<Wave> {
        let mut wave = Wave::default();
        match self.fill_wave(budget, &mut wave) {
            Ok(()) => Ok(wave),
            Err(error) => {
                for ticket in &wave.tickets {
                    self.abandon_run(ticket.computation());
                }
                Err(error)
            }
        }
    }

    fn fill_wave(&mut self, budget: &mut ExecutionBudget, wave: &mut Wave) -> Result<()> {
        let limit = self.config.max_recompute_rounds;

        loop {
            self.absorb_changes();
            let plan = self.scheduler.take_plan(&self.graph);
            let mut held: BTreeSet<NodeRef> = self
                .running
                .keys()
                .map(|&id| NodeRef::Computation(id))
                .collect();
            let mut applied_here = 0;

            for node in plan {
                let blocked = self
                    .graph
                    .upstream_processors(node)
                    .iter()
                    .any(|up| held.contains(up));
                if blocked {
                    held.insert(node);
                    self.scheduler.invalidate_node(node);
                    continue;
                }
                if !self.needs_processing(node) {
                    continue;
                }
                if !budget.spend(node, limit) {
                    return Err(self.diverged(budget.rounds()));
                }
                match node {
                    NodeRef::Connection(id) => {
                        self.apply_connection(id)?;
                        wave.connections_applied += 1;
                        applied_here += 1;
                    }
                    NodeRef::Computation(id) => {
                        match self.start_run(id) {
                            Ok(ticket) => wave.tickets.push(ticket),
                            Err(DocumentError::UnknownOperation(operation)) => {
                                let error = ComputationError::failed(format!(
                                    "unknown operation {operation}"
                                ));
                                self.record_failure(id, error)?;
                            }
                            Err(other) => return Err(other),
                        }
                        held.insert(node);
                    }
                    NodeRef::Item(_) => {}
                }
            }

            // connections applied this pass may have unblocked more work
            if applied_here == 0 || !wave.tickets.is_empty() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{OperationInput, OperationOutput, OperationRegistry};
    use crate::config::DocumentConfig;
    use crate::graph::ComputationSpec;
    use crate::store::ArrayBuffer;
    use crate::value::{Metadata, Parameters};

    fn copy(
        inputs: &[OperationInput],
        _: &Parameters,
    ) -> std::result::Result<OperationOutput, ComputationError> {
        Ok(OperationOutput::new(inputs[0].buffer.clone()))
    }

    fn document(limit: usize) -> Document {
        let config = DocumentConfig::default().with_max_recompute_rounds(limit);
        let mut doc = Document::new(config, OperationRegistry::new().with("copy", copy)).unwrap();
        doc.set_auto_settle(false);
        doc
    }

    #[test]
    fn failed_wave_releases_started_runs() {
        let mut doc = document(1);
        let a = doc
            .create_item(ArrayBuffer::from_f64(vec![4.0]), Metadata::new())
            .unwrap();
        let first = doc.add_computation(ComputationSpec::new("copy").input(a)).unwrap();
        let second = doc.add_computation(ComputationSpec::new("copy").input(a)).unwrap();

        // `second` has used its one execution already
        let mut budget = ExecutionBudget::default();
        assert!(budget.spend(NodeRef::Computation(second), 1));

        let wave = doc.prepare_wave(&mut budget);
        assert!(matches!(wave, Err(DocumentError::RecomputeDivergence { .. })));
        assert!(doc.running.is_empty());
        assert_eq!(doc.computation_state(first).unwrap(), ComputationState::Dirty);

        // the released run is seeded again
        doc.settle().unwrap();
        let out = doc.computation(first).unwrap().output();
        assert_eq!(doc.item(out).unwrap().buffer().values().to_f64_vec(), vec![4.0]);
        assert_eq!(doc.computation_state(first).unwrap(), ComputationState::Clean);
    }

    #[test]
    fn abandoned_run_result_is_dropped() {
        let mut doc = document(4);
        let a = doc
            .create_item(ArrayBuffer::from_f64(vec![1.0]), Metadata::new())
            .unwrap();
        let c = doc.add_computation(ComputationSpec::new("copy").input(a)).unwrap();

        let stale = doc.begin_run(c).unwrap();
        doc.abandon_run(c);
        let fresh = doc.begin_run(c).unwrap();
        assert!(fresh.run() > stale.run());

        assert_eq!(doc.commit_run(stale.execute()).unwrap(), CommitOutcome::Discarded);
        assert_eq!(doc.computation_state(c).unwrap(), ComputationState::Running);
        assert_eq!(
            doc.commit_run(fresh.execute()).unwrap(),
            CommitOutcome::Committed { output_changed: true }
        );
        assert_eq!(doc.computation_state(c).unwrap(), ComputationState::Clean);
    }
}

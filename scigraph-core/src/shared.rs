//! Shared document handle with off-lock execution.
//!
//! [`SharedDocument`] wraps a [`Document`] in a mutex so several tasks can
//! edit it, and settles it in waves:
//!
//! 1. Under the lock, plan the computations that can run now.
//! 2. Release the lock and run them on the blocking thread pool.
//! 3. Re-acquire the lock and commit each result. A result whose inputs
//!    were edited in the meantime is discarded and its computation is
//!    planned again.
//!
//! Edits made while a wave is running are never blocked for the duration
//! of an operation, only for the duration of a commit.

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::document::{Document, ExecutionBudget, FlushReport, SettleReport};
use crate::error::Result;

/// Cloneable, thread-safe handle to a document.
#[derive(Clone)]
pub struct SharedDocument {
    inner: Arc<Mutex<Document>>,
}

impl SharedDocument {
    /// Share a document. Commits no longer settle inline; call
    /// [`settle`](Self::settle).
    pub fn new(mut document: Document) -> Self {
        document.set_auto_settle(false);
        Self {
            inner: Arc::new(Mutex::new(document)),
        }
    }

    /// Run `f` with exclusive access.
    pub fn edit<T>(&self, f: impl FnOnce(&mut Document) -> Result<T>) -> Result<T> {
        f(&mut self.inner.lock())
    }

    /// Run `f` with shared access.
    pub fn read<T>(&self, f: impl FnOnce(&Document) -> T) -> T {
        f(&self.inner.lock())
    }

    /// Settle with computations running on worker threads.
    ///
    /// At most `worker_tasks` runs are in flight at once.
    #[instrument(skip(self), level = "debug")]
    pub async fn settle(&self) -> Result<SettleReport> {
        let mut report = SettleReport::default();
        let mut budget = ExecutionBudget::default();

        loop {
            let (wave, workers) = {
                let mut doc = self.inner.lock();
                doc.ensure_open()?;
                (doc.prepare_wave(&mut budget)?, doc.config().worker_tasks)
            };
            report.connections_applied += wave.connections_applied;
            if wave.tickets.is_empty() {
                break;
            }
            report.rounds += 1;
            debug!(round = report.rounds, runs = wave.tickets.len(), "wave started");

            let mut tickets = wave.tickets.into_iter().peekable();
            while tickets.peek().is_some() {
                let batch: Vec<_> = tickets.by_ref().take(workers.max(1)).collect();
                let ids: Vec<_> = batch.iter().map(|t| t.computation()).collect();
                let handles = batch
                    .into_iter()
                    .map(|ticket| tokio::task::spawn_blocking(move || ticket.execute()));
                let results = join_all(handles).await;

                let mut doc = self.inner.lock();
                let mut failure = None;
                for (id, joined) in ids.into_iter().zip(results) {
                    match joined {
                        Ok(result) => match doc.commit_run_inner(result) {
                            Ok(outcome) => report.tally(&outcome),
                            Err(error) => {
                                warn!(computation = %id, %error, "commit failed");
                                failure.get_or_insert(error);
                            }
                        },
                        Err(error) => {
                            warn!(computation = %id, %error, "worker did not finish");
                            doc.abandon_run(id);
                        }
                    }
                }
                if let Some(error) = failure {
                    // not yet spawned
                    for ticket in tickets.by_ref() {
                        doc.abandon_run(ticket.computation());
                    }
                    return Err(error);
                }
            }
        }

        let mut doc = self.inner.lock();
        if !doc.in_transaction() {
            doc.flush_events();
        }
        info!(
            rounds = report.rounds,
            executed = report.executed,
            discarded = report.discarded,
            "shared settle finished"
        );
        Ok(report)
    }

    /// Settle, flush and close the document.
    pub async fn close(&self) -> Result<FlushReport> {
        if let Err(error) = self.settle().await {
            warn!(%error, "closing unsettled");
        }
        self.inner.lock().close()
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument").finish_non_exhaustive()
    }
}

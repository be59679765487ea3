// 🔐 Transaction Manager - validate, stage and merge as one atomic run
//
//   Idle → Validating → Staged → Merging → Committed
//               ↓          ↓         ↓
//            Aborted    Aborted   RolledBack
//
// Cleanup on failure: rollback, drop staging, release connection (in that order).
// Cleanup on success: commit, drop staging, report, release connection.

use crate::config::ReconcilerConfig;
use crate::db::{bootstrap, Connector};
use crate::error::{Error, IoError, MergeError, ReportingError, Result};
use crate::merge::{commit_timestamp, merge, MergeSummary};
use crate::observability::{RunEvent, RunSink, TracingSink};
use crate::record::{RawBatch, RowRejection};
use crate::report::{summarize, Totals};
use crate::staging::{stage, StagingArea};
use crate::validator::{validate, ValidatedBatch};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// RUN STATE
// ============================================================================

/// Where a run is. `Staged` is entered once the batch passes validation and
/// covers acquiring the connection and loading the staging table, so any
/// failure there ends in `Aborted` from `Staged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Validating,
    Staged,
    Merging,
    Committed,
    Aborted,
    RolledBack,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Committed | RunState::Aborted | RunState::RolledBack
        )
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Staged)
                | (Staged, Merging)
                | (Merging, Committed)
                | (Validating, Aborted)
                | (Staged, Aborted)
                | (Merging, RolledBack)
        )
    }
}

/// One in-flight run: its id, current state, and where its events go.
struct Run<'a> {
    id: Uuid,
    state: RunState,
    sink: &'a dyn RunSink,
}

impl<'a> Run<'a> {
    fn new(sink: &'a dyn RunSink) -> Self {
        Run {
            id: Uuid::new_v4(),
            state: RunState::Idle,
            sink,
        }
    }

    fn advance(&mut self, next: RunState) {
        if !self.state.can_transition_to(next) {
            debug_assert!(false, "illegal run transition {:?} -> {:?}", self.state, next);
            return;
        }
        self.sink.record(&RunEvent::StateChanged {
            run_id: self.id,
            from: self.state,
            to: next,
        });
        self.state = next;
    }

    fn record(&self, event: RunEvent) {
        self.sink.record(&event);
    }

    /// Move to the failure terminal for the current state and hand the error back.
    fn fail(&mut self, err: Error) -> Error {
        let terminal = if self.state == RunState::Merging {
            RunState::RolledBack
        } else {
            RunState::Aborted
        };
        self.advance(terminal);
        self.record(RunEvent::Failed {
            run_id: self.id,
            kind: err.kind(),
            error: err.to_string(),
        });
        err
    }

    fn cleanup_failed(&self, resource: &'static str, err: &dyn std::fmt::Display) {
        self.record(RunEvent::CleanupFailed {
            run_id: self.id,
            resource,
            error: err.to_string(),
        });
    }

    fn rollback(&self, tx: Transaction<'_>) {
        if let Err(err) = tx.rollback() {
            self.cleanup_failed("transaction", &err);
        }
    }

    fn release_staging(&self, staging: StagingArea<'_>) {
        if let Err(err) = staging.release() {
            self.cleanup_failed("staging", &err);
        }
    }

    fn release_connection(&self, conn: Connection) {
        if let Err((_, err)) = conn.close() {
            self.cleanup_failed("connection", &err);
        }
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

/// Result of a committed run.
#[derive(Debug)]
pub struct BatchOutcome {
    pub run_id: Uuid,
    pub interval_date: NaiveDate,
    pub summary: MergeSummary,
    pub committed_at: DateTime<Utc>,
    pub fingerprint: String,
    pub rejected: Vec<RowRejection>,
    totals: std::result::Result<Totals, ReportingError>,
}

impl BatchOutcome {
    /// Post-commit totals. An error here means only the report failed; the
    /// batch itself is committed.
    pub fn totals(&self) -> std::result::Result<&Totals, &ReportingError> {
        self.totals.as_ref()
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

/// Applies batches to the durable table. Cheap to share across threads; each
/// run opens and owns its own connection.
pub struct Reconciler {
    connector: Arc<dyn Connector>,
    sink: Arc<dyn RunSink>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(connector: Arc<dyn Connector>, config: ReconcilerConfig) -> Self {
        Reconciler {
            connector,
            sink: Arc::new(TracingSink),
            config,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RunSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Apply a batch for today's date (UTC).
    pub fn apply_batch(&self, batch: &RawBatch) -> Result<BatchOutcome> {
        self.apply_batch_on(batch, Utc::now().date_naive())
    }

    /// Apply a batch for an explicit interval date, e.g. a backfill.
    pub fn apply_batch_on(&self, batch: &RawBatch, interval_date: NaiveDate) -> Result<BatchOutcome> {
        let mut run = Run::new(self.sink.as_ref());
        run.advance(RunState::Validating);

        // No connection is requested until the batch passes validation
        let validated = match validate(batch, interval_date) {
            Ok(validated) => validated,
            Err(err) => return Err(run.fail(err.into())),
        };
        for rejection in validated.rejected() {
            run.record(RunEvent::RowRejected {
                run_id: run.id,
                rejection: rejection.clone(),
            });
        }
        run.advance(RunState::Staged);

        let conn = match self.connector.connect() {
            Ok(conn) => conn,
            Err(err) => return Err(run.fail(err.into())),
        };

        let result = self.reconcile(&mut run, &conn, &validated);
        run.release_connection(conn);
        result
    }

    fn reconcile(
        &self,
        run: &mut Run<'_>,
        conn: &Connection,
        batch: &ValidatedBatch,
    ) -> Result<BatchOutcome> {
        let table = self.config.table();

        if let Err(err) = bootstrap(conn, table) {
            return Err(run.fail(err.into()));
        }

        // IMMEDIATE takes the write lock up front so concurrent runs queue on
        // the busy timeout instead of failing on lock upgrade.
        let tx = match Transaction::new_unchecked(conn, TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(err) => return Err(run.fail(IoError::Begin(err).into())),
        };

        let staging = match stage(conn, run.id, batch) {
            Ok(staging) => staging,
            Err(err) => {
                run.rollback(tx);
                return Err(run.fail(err.into()));
            }
        };
        run.record(RunEvent::Staged {
            run_id: run.id,
            table: staging.table().to_string(),
            rows: staging.rows(),
            fingerprint: batch.fingerprint(),
        });

        run.advance(RunState::Merging);
        let merged = commit_timestamp(conn, table, batch.interval_date(), Utc::now())
            .and_then(|ts| merge(conn, table, &staging, ts).map(|summary| (summary, ts)));
        let (summary, committed_at) = match merged {
            Ok(merged) => merged,
            Err(err) => {
                run.rollback(tx);
                run.release_staging(staging);
                return Err(run.fail(err.into()));
            }
        };
        run.record(RunEvent::Merged {
            run_id: run.id,
            summary,
        });

        // A failed commit rolls back when the transaction drops
        if let Err(err) = tx.commit() {
            run.release_staging(staging);
            return Err(run.fail(MergeError::Commit(err).into()));
        }
        run.advance(RunState::Committed);
        run.record(RunEvent::Committed {
            run_id: run.id,
            interval_date: batch.interval_date(),
            committed_at,
        });
        run.release_staging(staging);

        let totals = summarize(
            conn,
            table,
            batch.interval_date(),
            self.config.recent_window,
            Utc::now(),
        );
        match &totals {
            Ok(totals) => run.record(RunEvent::Totals {
                run_id: run.id,
                interval_date: batch.interval_date(),
                totals: *totals,
            }),
            Err(err) => run.record(RunEvent::ReportingFailed {
                run_id: run.id,
                error: err.to_string(),
            }),
        }

        Ok(BatchOutcome {
            run_id: run.id,
            interval_date: batch.interval_date(),
            summary,
            committed_at,
            fingerprint: batch.fingerprint(),
            rejected: batch.rejected().to_vec(),
            totals,
        })
    }
}

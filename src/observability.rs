// 📡 Observability - run events and the sinks they are written to
// The library never logs through a global; every event goes to an injected sink.

use crate::merge::MergeSummary;
use crate::reconciler::RunState;
use crate::record::RowRejection;
use crate::report::Totals;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// RUN EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    StateChanged {
        run_id: Uuid,
        from: RunState,
        to: RunState,
    },
    RowRejected {
        run_id: Uuid,
        rejection: RowRejection,
    },
    Staged {
        run_id: Uuid,
        table: String,
        rows: usize,
        fingerprint: String,
    },
    Merged {
        run_id: Uuid,
        summary: MergeSummary,
    },
    Committed {
        run_id: Uuid,
        interval_date: NaiveDate,
        committed_at: DateTime<Utc>,
    },
    Failed {
        run_id: Uuid,
        kind: &'static str,
        error: String,
    },
    CleanupFailed {
        run_id: Uuid,
        resource: &'static str,
        error: String,
    },
    Totals {
        run_id: Uuid,
        interval_date: NaiveDate,
        totals: Totals,
    },
    ReportingFailed {
        run_id: Uuid,
        error: String,
    },
    EnrichmentFailed {
        video_url: String,
        reason: String,
    },
}

/// Destination for run events.
pub trait RunSink: Send + Sync {
    fn record(&self, event: &RunEvent);
}

// ============================================================================
// TRACING SINK
// ============================================================================

/// Forwards run events to `tracing` with structured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl RunSink for TracingSink {
    fn record(&self, event: &RunEvent) {
        match event {
            RunEvent::StateChanged { run_id, from, to } => {
                tracing::debug!(%run_id, from = ?from, to = ?to, "run state changed");
            }
            RunEvent::RowRejected { run_id, rejection } => {
                tracing::warn!(%run_id, index = rejection.index, reason = %rejection.reason, "row rejected");
            }
            RunEvent::Staged {
                run_id,
                table,
                rows,
                fingerprint,
            } => {
                tracing::info!(%run_id, %table, rows, %fingerprint, "batch staged");
            }
            RunEvent::Merged { run_id, summary } => {
                tracing::info!(
                    %run_id,
                    inserted = summary.rows_inserted,
                    updated = summary.rows_updated,
                    "merge applied"
                );
            }
            RunEvent::Committed {
                run_id,
                interval_date,
                committed_at,
            } => {
                tracing::info!(%run_id, %interval_date, %committed_at, "changes committed");
            }
            RunEvent::Failed { run_id, kind, error } => {
                tracing::error!(%run_id, kind, %error, "run failed, transaction rolled back");
            }
            RunEvent::CleanupFailed {
                run_id,
                resource,
                error,
            } => {
                tracing::warn!(%run_id, resource, %error, "cleanup failed");
            }
            RunEvent::Totals {
                run_id,
                interval_date,
                totals,
            } => {
                tracing::info!(
                    %run_id,
                    %interval_date,
                    total_rows_today = totals.total_rows_today,
                    updated_rows_recent = totals.updated_rows_recent,
                    "post-commit totals"
                );
            }
            RunEvent::ReportingFailed { run_id, error } => {
                tracing::warn!(%run_id, %error, "post-commit reporting failed");
            }
            RunEvent::EnrichmentFailed { video_url, reason } => {
                tracing::warn!(%video_url, %reason, "video metadata lookup failed");
            }
        }
    }
}

// ============================================================================
// MEMORY SINK
// ============================================================================

/// Keeps every event in memory. Useful in tests and for CLI summaries.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// States visited, in order, across all runs recorded here.
    pub fn states(&self) -> Vec<RunState> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                RunEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }
}

impl RunSink for MemorySink {
    fn record(&self, event: &RunEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::client::ReportSource;
use crate::error::SyncError;
use crate::models::{Report, ReportStatus};
use crate::statuses::StatusStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// Rows and their status index for one run. Shared read-only by every
/// extractor.
#[derive(Debug)]
pub struct LoadedReport {
    pub job: ReportStatus,
    pub rows: Report,
    pub statuses: StatusStore,
}

struct Lifecycle {
    state: SyncState,
    outcome: Option<Result<Arc<LoadedReport>, SyncError>>,
}

/// Drives report generation at most once per run and gates extractors on it.
pub struct ReportSync {
    source: Arc<dyn ReportSource>,
    lookback: chrono::Duration,
    run_id: Uuid,
    lifecycle: RwLock<Lifecycle>,
}

impl ReportSync {
    pub fn new(source: Arc<dyn ReportSource>, lookback: chrono::Duration) -> Self {
        Self {
            source,
            lookback,
            run_id: Uuid::new_v4(),
            lifecycle: RwLock::new(Lifecycle {
                state: SyncState::NotStarted,
                outcome: None,
            }),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn state(&self) -> SyncState {
        self.lifecycle.read().await.state
    }

    /// Exercises the credentials by generating the run's report.
    pub async fn validate(&self) -> Result<Arc<LoadedReport>, SyncError> {
        self.wait_for_report().await
    }

    /// Returns the run's report, generating it on the first call. Later
    /// calls replay the cached report or the cached failure.
    pub async fn wait_for_report(&self) -> Result<Arc<LoadedReport>, SyncError> {
        if let Some(outcome) = self.lifecycle.read().await.outcome.clone() {
            return outcome;
        }

        let mut lifecycle = self.lifecycle.write().await;
        if let Some(outcome) = lifecycle.outcome.clone() {
            return outcome;
        }

        // A previous writer was dropped mid-generation.
        if lifecycle.state == SyncState::InProgress {
            warn!(run_id = %self.run_id, "previous report generation was interrupted");
            lifecycle.state = SyncState::Failed;
            lifecycle.outcome = Some(Err(SyncError::Interrupted));
            return Err(SyncError::Interrupted);
        }

        lifecycle.state = SyncState::InProgress;
        let span = tracing::info_span!("report_generation", run_id = %self.run_id);
        let outcome = self.generate().instrument(span).await.map(Arc::new);

        lifecycle.state = match outcome {
            Ok(_) => SyncState::Completed,
            Err(_) => SyncState::Failed,
        };
        lifecycle.outcome = Some(outcome.clone());
        outcome
    }

    async fn generate(&self) -> Result<LoadedReport, SyncError> {
        info!(
            lookback_days = self.lookback.num_days(),
            "starting learning activity report generation"
        );
        let started = Instant::now();

        let job = self.source.request_generation(self.lookback).await.map_err(|e| {
            error!(
                error = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                "failed to request learning activity report"
            );
            e
        })?;

        let load_started = Instant::now();
        let rows = self.source.await_completion(&job).await.map_err(|e| {
            error!(
                error = %e,
                generation_ms = started.elapsed().as_millis() as u64,
                load_ms = load_started.elapsed().as_millis() as u64,
                "failed to retrieve learning activity report"
            );
            e
        })?;

        let statuses = StatusStore::build(&rows);
        info!(
            report_id = %job.id,
            report_entries = rows.len(),
            unique_courses = statuses.course_count(),
            total_ms = started.elapsed().as_millis() as u64,
            load_ms = load_started.elapsed().as_millis() as u64,
            "learning activity report loaded"
        );

        Ok(LoadedReport {
            job,
            rows,
            statuses,
        })
    }
}

use thiserror::Error;

/// Failures of a sync run. `Clone` so a cached failure can be replayed to
/// every later caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("invalid client configuration: {0}")]
    Configuration(String),
    #[error("failed to request learning activity report: {0}")]
    Generation(String),
    #[error("report generation failed: id={id}, error={detail}")]
    ReportGenerationFailed { id: String, detail: String },
    #[error("report {id} not ready after {attempts} attempts")]
    PollingTimeout { id: String, attempts: u32 },
    #[error("error fetching report: {0}")]
    Transport(String),
    #[error("report generation was interrupted before completing")]
    Interrupted,
}

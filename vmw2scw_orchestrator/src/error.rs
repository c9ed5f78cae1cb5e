//! Batch-level error taxonomy (§7): configuration failures are fatal
//! before any VM runs; everything else is scoped to a single VM and
//! recorded on its [`vmw2scw_types::VmJob`] instead of aborting the batch.

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("batch {0} not found")]
    BatchNotFound(String),
    #[error("state store error: {0}")]
    State(#[from] vmw2scw_state::StateError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

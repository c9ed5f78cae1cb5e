//! Error taxonomy for one VM's pipeline run (§7).

use vmw2scw_types::Stage;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("[{stage:?}] precondition failed: {message}")]
    Precondition { stage: Stage, message: String },
    #[error("[{stage:?}] external tool failed: {source}")]
    Tool {
        stage: Stage,
        #[source]
        source: vmw2scw_proc::ProcError,
    },
    #[error("[{stage:?}] remote collaborator failed: {source}")]
    Collab {
        stage: Stage,
        #[source]
        source: vmw2scw_collab::CollabError,
    },
    #[error("[{stage:?}] integrity check failed: {message}")]
    Integrity { stage: Stage, message: String },
    #[error("[{stage:?}] timed out: {message}")]
    Timeout { stage: Stage, message: String },
    #[error("[{stage:?}] I/O error: {source}")]
    Io {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
    #[error("cancelled at stage boundary: {stage:?}")]
    Cancelled { stage: Stage },
    #[error("state store error: {0}")]
    State(#[from] vmw2scw_state::StateError),
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Precondition { stage, .. }
            | PipelineError::Tool { stage, .. }
            | PipelineError::Collab { stage, .. }
            | PipelineError::Integrity { stage, .. }
            | PipelineError::Timeout { stage, .. }
            | PipelineError::Io { stage, .. }
            | PipelineError::Cancelled { stage } => Some(*stage),
            PipelineError::State(_) => None,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

//! Error taxonomy for the disk-adaptation engines (§7 "External tool
//! failure", "Integrity", "Timeout").

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("external tool failed: {0}")]
    Tool(#[from] vmw2scw_proc::ProcError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("timed out waiting for: {0}")]
    Timeout(String),
    #[error("precondition not met: {0}")]
    Precondition(String),
}

pub type AdapterResult<T> = Result<T, AdapterError>;

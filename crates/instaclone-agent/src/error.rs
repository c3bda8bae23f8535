use thiserror::Error;

pub type AgentResult<T> = std::result::Result<T, AgentError>;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed bootstrap blob: {0}")]
    BadBlob(#[from] serde_json::Error),

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
}

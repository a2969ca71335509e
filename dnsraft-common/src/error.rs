use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Writes must go to the leader; `leader` is the best-known raft address.
    #[error("Not the leader, leader is {leader:?}")]
    NotLeader { leader: Option<String> },

    #[error("Operation timed out")]
    Timeout,

    #[error("Join failed: {0}")]
    JoinFailed(String),

    #[error("Parse Error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Consensus Error: {0}")]
    Consensus(String),

    #[error("Store is shut down")]
    Shutdown,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Codec(format!("Bincode Error: {}", err))
    }
}

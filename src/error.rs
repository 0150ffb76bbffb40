use thiserror::Error;

pub type Result<T, E = ExportError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ExportError {
    /// The slot is missing and creation was not requested.
    #[error("replication slot {0:?} does not exist")]
    SlotDoesNotExist(String),

    /// A snapshot handle can only be obtained while creating a slot.
    #[error("replication slot {0:?} already exists, cannot take an initial snapshot from it")]
    SlotAlreadyExists(String),

    #[error("failed to create replication slot {slot:?}: {reason}")]
    SlotCreation { slot: String, reason: String },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("replication protocol error: {0}")]
    Protocol(String),

    #[error("consumer failed: {0:#}")]
    Consumer(anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    /// Errors the streaming loop recovers from by reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExportError::Connection(_)
                | ExportError::Query(_)
                | ExportError::Protocol(_)
                | ExportError::Io(_)
        )
    }
}

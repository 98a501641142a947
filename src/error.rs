use thiserror::Error;

/// Error taxonomy for the table client and harness.
///
/// Every facade call returns one of these; the harness treats all of them as
/// fatal except the single table-missing recovery during batch submission.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{resource} already exists")]
    Conflict { resource: String },

    #[error("Table {0} does not exist")]
    TableNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, TableError>;

impl From<reqwest::Error> for TableError {
    fn from(err: reqwest::Error) -> Self {
        TableError::Transport(err.to_string())
    }
}

impl TableError {
    /// True when the error indicates the target table is missing, the one
    /// condition the batch path is allowed to recover from.
    pub fn is_table_missing(&self) -> bool {
        matches!(self, TableError::TableNotFound(_))
    }
}

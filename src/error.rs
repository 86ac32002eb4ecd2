// Ledger Errors
// The four fatal kinds a caller has to render:
// - CorruptStore: the byte buffer is not a usable store image
// - SchemaError: an existing table is incompatible with the ledger schema
// - UnknownAccountReference: a transaction points at a missing account
// - NotReady: an operation was called before the schema was ensured
//
// Nothing here is retried; the caller decides whether to re-import or abort.

use thiserror::Error;

use crate::store::HandleState;

/// Result type alias for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("corrupt store image: {reason}")]
    CorruptStore { reason: String },

    #[error("schema error in table '{table}': {reason} (expected columns {expected:?}, found {found:?})")]
    SchemaError {
        table: String,
        expected: Vec<String>,
        found: Vec<String>,
        reason: String,
    },

    #[error("transaction {transaction_id} references unknown account {account_id}")]
    UnknownAccountReference { transaction_id: i64, account_id: i64 },

    #[error("'{operation}' is not valid while the store handle is {state}")]
    NotReady {
        operation: &'static str,
        state: HandleState,
    },

    #[error("account {0} not found")]
    AccountNotFound(i64),

    #[error("balance of account {account_id} overflowed at transaction {transaction_id}")]
    BalanceOverflow { account_id: i64, transaction_id: i64 },

    #[error("invalid amount '{value}': {reason}")]
    InvalidAmount { value: String, reason: String },

    #[error("invalid timestamp '{0}', expected YYYY-MM-DD HH:MM:SS")]
    InvalidTimestamp(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl LedgerError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        LedgerError::CorruptStore {
            reason: reason.into(),
        }
    }

    /// True for errors that mean the store image itself cannot be trusted
    pub fn is_fatal_for_store(&self) -> bool {
        matches!(
            self,
            LedgerError::CorruptStore { .. } | LedgerError::SchemaError { .. }
        )
    }
}

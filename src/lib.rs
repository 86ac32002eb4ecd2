// Money Ledger - Core Library
// File-backed ledger data layer: store image bytes in, balances and account
// listings out, store image bytes back.
//
// bytes -> store (open) -> schema (ensure) -> balance / query -> store (serialize) -> bytes

pub mod balance;
pub mod config;
pub mod db;
pub mod error;
pub mod query;
pub mod schema;
pub mod store;

// Re-export commonly used types
pub use balance::{
    aggregate, balances_as_of, compute_balances, running_balances,
    Balance, BalanceAggregator, RunningBalance,
};
pub use config::LedgerConfig;
pub use db::{
    Account, Transaction, NewTransaction,
    get_account, all_accounts, all_transactions, transactions_for_account, count_transactions,
    insert_account, insert_transaction, rename_account, set_hidden,
    import_accounts_csv, import_transactions_csv,
    parse_minor_units, format_minor_units, parse_timestamp, format_timestamp,
};
pub use error::{LedgerError, Result};
pub use query::{
    accounts_with_activity_since, list_accounts,
    AccountBalance, AccountFilter, LikePattern,
};
pub use schema::{describe_schema, ensure_schema, SchemaDescription, SCHEMA_VERSION};
pub use store::{open, open_with_config, serialize, Handle, HandleState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Open an image and ensure its schema in one step.
pub fn load(bytes: &[u8], config: LedgerConfig) -> Result<Handle> {
    let mut handle = open_with_config(bytes, config)?;
    ensure_schema(&mut handle)?;
    Ok(handle)
}

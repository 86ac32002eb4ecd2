use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{LedgerError, Result};
use crate::store::Handle;

/// Canonical on-disk timestamp format; sorts lexically in time order
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Other layouts accepted when reading imported data
const ALTERNATE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y%m%d%H%M%S"];

/// Amounts are stored as integers of 1/100 of the currency unit
pub const MINOR_UNIT_SCALE: u32 = 2;

// ============================================================================
// ROW TYPES
// ============================================================================

/// Account row. Never deleted; only renamed or hidden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub account_id: i64,
    /// Signed amount in minor units
    pub amount: i64,
    pub timestamp: NaiveDateTime,
    pub memo: Option<String>,
}

/// Transaction to insert; `id` is assigned by the store when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub id: Option<i64>,
    pub account_id: i64,
    pub amount: i64,
    pub timestamp: NaiveDateTime,
    pub memo: Option<String>,
}

impl NewTransaction {
    pub fn new(account_id: i64, amount: i64, timestamp: NaiveDateTime) -> Self {
        NewTransaction {
            id: None,
            account_id,
            amount,
            timestamp,
            memo: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_memo(mut self, memo: &str) -> Self {
        self.memo = Some(memo.to_string());
        self
    }
}

// ============================================================================
// AMOUNTS & TIMESTAMPS
// ============================================================================

/// Parse a decimal amount in major units ("-30.05") into minor units (-3005).
/// Rejects anything that would lose precision.
pub fn parse_minor_units(text: &str) -> Result<i64> {
    let invalid = |reason: &str| LedgerError::InvalidAmount {
        value: text.to_string(),
        reason: reason.to_string(),
    };

    let value = Decimal::from_str(text.trim()).map_err(|_| invalid("not a decimal number"))?;
    if value.normalize().scale() > MINOR_UNIT_SCALE {
        return Err(invalid("more than 2 decimal places"));
    }

    value
        .checked_mul(Decimal::from(10_i64.pow(MINOR_UNIT_SCALE)))
        .and_then(|minor| minor.to_i64())
        .ok_or_else(|| invalid("out of range"))
}

/// Render minor units as a decimal string in major units (7500 -> "75.00").
pub fn format_minor_units(amount: i64) -> String {
    Decimal::new(amount, MINOR_UNIT_SCALE).to_string()
}

pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime> {
    let text = text.trim();
    std::iter::once(TIMESTAMP_FORMAT)
        .chain(ALTERNATE_TIMESTAMP_FORMATS)
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| LedgerError::InvalidTimestamp(text.to_string()))
}

pub fn format_timestamp(timestamp: &NaiveDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

// ============================================================================
// READS
// ============================================================================

/// Raw transaction row; the timestamp is parsed outside the rusqlite closure
/// so a bad value surfaces as `InvalidTimestamp` rather than a column error.
pub(crate) struct TransactionRow {
    pub id: i64,
    pub account_id: i64,
    pub amount: i64,
    pub timestamp: String,
    pub memo: Option<String>,
}

impl TransactionRow {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(TransactionRow {
            id: row.get(0)?,
            account_id: row.get(1)?,
            amount: row.get(2)?,
            timestamp: row.get(3)?,
            memo: row.get(4)?,
        })
    }

    pub(crate) fn into_transaction(self) -> Result<Transaction> {
        Ok(Transaction {
            id: self.id,
            account_id: self.account_id,
            amount: self.amount,
            timestamp: parse_timestamp(&self.timestamp)?,
            memo: self.memo,
        })
    }
}

pub(crate) const TRANSACTION_COLUMNS: &str = "id, account_id, amount, timestamp, memo";

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        hidden: row.get(2)?,
    })
}

fn find_account(conn: &Connection, id: i64) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            "SELECT id, name, hidden FROM accounts WHERE id = ?1",
            params![id],
            account_from_row,
        )
        .optional()?;
    Ok(account)
}

pub fn get_account(handle: &Handle, id: i64) -> Result<Account> {
    let conn = handle.ready_connection("get_account")?;
    find_account(conn, id)?.ok_or(LedgerError::AccountNotFound(id))
}

/// All accounts, hidden ones included, ordered by id.
pub fn all_accounts(handle: &Handle) -> Result<Vec<Account>> {
    let conn = handle.ready_connection("all_accounts")?;
    let mut stmt = conn.prepare("SELECT id, name, hidden FROM accounts ORDER BY id")?;
    let accounts = stmt
        .query_map([], account_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(accounts)
}

/// All transactions ordered by (timestamp, id).
pub fn all_transactions(handle: &Handle) -> Result<Vec<Transaction>> {
    let conn = handle.ready_connection("all_transactions")?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM transactions ORDER BY timestamp, id",
        TRANSACTION_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], TransactionRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut transactions = rows
        .into_iter()
        .map(TransactionRow::into_transaction)
        .collect::<Result<Vec<_>>>()?;
    transactions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    Ok(transactions)
}

/// Transactions of one account ordered by (timestamp, id).
pub fn transactions_for_account(handle: &Handle, account_id: i64) -> Result<Vec<Transaction>> {
    let conn = handle.ready_connection("transactions_for_account")?;
    if find_account(conn, account_id)?.is_none() {
        return Err(LedgerError::AccountNotFound(account_id));
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM transactions WHERE account_id = ?1 ORDER BY timestamp, id",
        TRANSACTION_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![account_id], TransactionRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut transactions = rows
        .into_iter()
        .map(TransactionRow::into_transaction)
        .collect::<Result<Vec<_>>>()?;
    transactions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    Ok(transactions)
}

pub fn count_transactions(handle: &Handle) -> Result<i64> {
    let conn = handle.ready_connection("count_transactions")?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// MUTATIONS (rename / hide / import only - nothing is ever deleted)
// ============================================================================

pub fn insert_account(handle: &mut Handle, name: &str, hidden: bool) -> Result<Account> {
    let conn = handle.ready_connection_mut("insert_account")?;
    conn.execute(
        "INSERT INTO accounts (name, hidden) VALUES (?1, ?2)",
        params![name, hidden],
    )?;
    let account = Account {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        hidden,
    };
    debug!(id = account.id, account_name = name, "inserted account");
    Ok(account)
}

pub fn insert_transaction(handle: &mut Handle, new: NewTransaction) -> Result<Transaction> {
    let conn = handle.ready_connection_mut("insert_transaction")?;
    let tx = conn.transaction()?;
    let transaction = insert_transaction_row(&tx, &new)?;
    tx.commit()?;
    debug!(id = transaction.id, account_id = transaction.account_id, "inserted transaction");
    Ok(transaction)
}

/// Insert inside an open SQL transaction; the caller rolls back on error.
fn insert_transaction_row(conn: &Connection, new: &NewTransaction) -> Result<Transaction> {
    conn.execute(
        "INSERT INTO transactions (id, account_id, amount, timestamp, memo)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            new.id,
            new.account_id,
            new.amount,
            format_timestamp(&new.timestamp),
            new.memo,
        ],
    )?;
    let id = conn.last_insert_rowid();

    if find_account(conn, new.account_id)?.is_none() {
        return Err(LedgerError::UnknownAccountReference {
            transaction_id: id,
            account_id: new.account_id,
        });
    }

    Ok(Transaction {
        id,
        account_id: new.account_id,
        amount: new.amount,
        timestamp: new.timestamp,
        memo: new.memo.clone(),
    })
}

pub fn rename_account(handle: &mut Handle, id: i64, name: &str) -> Result<()> {
    let conn = handle.ready_connection_mut("rename_account")?;
    let updated = conn.execute(
        "UPDATE accounts SET name = ?1 WHERE id = ?2",
        params![name, id],
    )?;
    if updated == 0 {
        return Err(LedgerError::AccountNotFound(id));
    }
    info!(id, new_name = name, "renamed account");
    Ok(())
}

pub fn set_hidden(handle: &mut Handle, id: i64, hidden: bool) -> Result<()> {
    let conn = handle.ready_connection_mut("set_hidden")?;
    let updated = conn.execute(
        "UPDATE accounts SET hidden = ?1 WHERE id = ?2",
        params![hidden, id],
    )?;
    if updated == 0 {
        return Err(LedgerError::AccountNotFound(id));
    }
    info!(id, hidden, "changed account visibility");
    Ok(())
}

// ============================================================================
// CSV IMPORT
// ============================================================================

#[derive(Debug, Deserialize)]
struct AccountRecord {
    id: i64,
    name: String,
    #[serde(deserialize_with = "deserialize_flag")]
    hidden: bool,
}

#[derive(Debug, Deserialize)]
struct TransactionRecord {
    id: i64,
    account_id: i64,
    amount: String,
    timestamp: String,
    memo: Option<String>,
}

/// Accepts true/false, yes/no and 1/0 (case-insensitive)
fn deserialize_flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        other => Err(de::Error::custom(format!("invalid hidden flag '{}'", other))),
    }
}

/// Import accounts from CSV with header `id,name,hidden`.
/// All rows are written or none are.
pub fn import_accounts_csv<R: Read>(handle: &mut Handle, reader: R) -> Result<usize> {
    let conn = handle.ready_connection_mut("import_accounts_csv")?;
    let mut rdr = csv::Reader::from_reader(reader);

    let tx = conn.transaction()?;
    let mut imported = 0;
    for result in rdr.deserialize() {
        let record: AccountRecord = result?;
        tx.execute(
            "INSERT INTO accounts (id, name, hidden) VALUES (?1, ?2, ?3)",
            params![record.id, record.name, record.hidden],
        )?;
        imported += 1;
    }
    tx.commit()?;

    info!(imported, "imported accounts from CSV");
    Ok(imported)
}

/// Import transactions from CSV with header `id,account_id,amount,timestamp,memo`.
/// `amount` is a decimal in major units. All rows are written or none are.
pub fn import_transactions_csv<R: Read>(handle: &mut Handle, reader: R) -> Result<usize> {
    let conn = handle.ready_connection_mut("import_transactions_csv")?;
    let mut rdr = csv::Reader::from_reader(reader);

    let tx = conn.transaction()?;
    let mut imported = 0;
    for result in rdr.deserialize() {
        let record: TransactionRecord = result?;
        let new = NewTransaction {
            id: Some(record.id),
            account_id: record.account_id,
            amount: parse_minor_units(&record.amount)?,
            timestamp: parse_timestamp(&record.timestamp)?,
            memo: record.memo.filter(|memo| !memo.is_empty()),
        };
        insert_transaction_row(&tx, &new)?;
        imported += 1;
    }
    tx.commit()?;

    info!(imported, "imported transactions from CSV");
    Ok(imported)
}

// Schema Manager
// Creates the ledger tables on first load and verifies them on every later load.
// An incompatible table is an error, never silently migrated.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, Result};
use crate::store::Handle;

/// Stored in `PRAGMA user_version` once the schema has been applied
pub const SCHEMA_VERSION: i64 = 1;

// ============================================================================
// REQUIRED TABLES
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    create_sql: &'static str,
}

pub const ACCOUNTS_TABLE: TableSpec = TableSpec {
    name: "accounts",
    columns: &["id", "name", "hidden"],
    create_sql: "CREATE TABLE accounts (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            hidden INTEGER NOT NULL DEFAULT 0
        )",
};

/// `amount` is in minor units; `timestamp` is `YYYY-MM-DD HH:MM:SS` text.
/// No foreign key on `account_id`: dangling references are reported by the aggregator.
pub const TRANSACTIONS_TABLE: TableSpec = TableSpec {
    name: "transactions",
    columns: &["id", "account_id", "amount", "timestamp", "memo"],
    create_sql: "CREATE TABLE transactions (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL,
            amount INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            memo TEXT
        )",
};

pub const REQUIRED_TABLES: [TableSpec; 2] = [ACCOUNTS_TABLE, TRANSACTIONS_TABLE];

const INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS idx_transactions_account_order
    ON transactions(account_id, timestamp, id)";

// ============================================================================
// ENSURE
// ============================================================================

/// Apply or verify the ledger schema and move the handle to `SchemaReady`.
/// Calling it on a ready handle does nothing.
pub fn ensure_schema(handle: &mut Handle) -> Result<()> {
    if handle.is_schema_ready() {
        debug!("schema already ensured");
        return Ok(());
    }

    let conn = handle.open_connection_mut("ensure_schema")?;

    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        warn!(version, supported = SCHEMA_VERSION, "store schema is newer than supported");
        return Err(LedgerError::SchemaError {
            table: "*".to_string(),
            expected: vec![format!("user_version <= {}", SCHEMA_VERSION)],
            found: vec![format!("user_version = {}", version)],
            reason: "store was written by a newer schema version".to_string(),
        });
    }

    let tx = conn.transaction()?;
    for spec in REQUIRED_TABLES {
        match table_columns(&tx, spec.name)? {
            None => {
                tx.execute_batch(spec.create_sql)?;
                info!(table = spec.name, "created table");
            }
            Some(found) => {
                check_columns(&spec, &found)?;
                check_row_key(&tx, &spec, found)?;
            }
        }
    }
    tx.execute_batch(INDEX_SQL)?;
    if version == 0 {
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    tx.commit()?;

    handle.mark_schema_ready();
    Ok(())
}

/// Columns of an existing table, or `None` when no object with that name exists.
fn table_columns(conn: &Connection, table: &str) -> Result<Option<Vec<String>>> {
    let kind: Option<String> = conn
        .query_row(
            "SELECT type FROM sqlite_master
             WHERE name = ?1 COLLATE NOCASE AND type IN ('table', 'view')",
            params![table],
            |row| row.get(0),
        )
        .optional()?;

    match kind.as_deref() {
        None => Ok(None),
        Some("table") => {
            let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
            let columns = stmt
                .query_map(params![table], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Some(columns))
        }
        Some(other) => Err(LedgerError::SchemaError {
            table: table.to_string(),
            expected: vec!["table".to_string()],
            found: vec![other.to_string()],
            reason: format!("'{}' exists but is a {}", table, other),
        }),
    }
}

fn check_columns(spec: &TableSpec, found: &[String]) -> Result<()> {
    let lowered: Vec<String> = found.iter().map(|c| c.to_lowercase()).collect();
    let missing: Vec<&str> = spec
        .columns
        .iter()
        .copied()
        .filter(|required| !lowered.iter().any(|c| c == required))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    warn!(table = spec.name, ?missing, "incompatible table");
    Err(LedgerError::SchemaError {
        table: spec.name.to_string(),
        expected: spec.columns.iter().map(|c| c.to_string()).collect(),
        found: found.to_vec(),
        reason: format!("missing required column(s) {}", missing.join(", ")),
    })
}

/// `id` must be the table's only primary key column and declared INTEGER,
/// so ids are unique and the (timestamp, id) order is total.
fn check_row_key(conn: &Connection, spec: &TableSpec, found: Vec<String>) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT name, upper(type) FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk",
    )?;
    let key = stmt
        .query_map(params![spec.name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    match key.as_slice() {
        [(name, declared)] if name.eq_ignore_ascii_case("id") && declared == "INTEGER" => {
            debug!(table = spec.name, "table verified");
            Ok(())
        }
        _ => {
            let key_desc: Vec<String> = key
                .iter()
                .map(|(name, declared)| format!("{} {}", name, declared))
                .collect();
            warn!(table = spec.name, key = ?key_desc, "table id is not an integer primary key");
            Err(LedgerError::SchemaError {
                table: spec.name.to_string(),
                expected: spec.columns.iter().map(|c| c.to_string()).collect(),
                found,
                reason: if key_desc.is_empty() {
                    "'id' must be the INTEGER PRIMARY KEY; table has no primary key".to_string()
                } else {
                    format!(
                        "'id' must be the INTEGER PRIMARY KEY; primary key is ({})",
                        key_desc.join(", ")
                    )
                },
            })
        }
    }
}

// ============================================================================
// DESCRIBE
// ============================================================================

/// Snapshot of the user tables in a store, used to compare stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescription {
    pub user_version: i64,
    pub tables: BTreeMap<String, Vec<String>>,
    pub indexes: Vec<String>,
}

pub fn describe_schema(handle: &Handle) -> Result<SchemaDescription> {
    let conn = handle.open_connection("describe_schema")?;

    let user_version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tables = BTreeMap::new();
    for name in names {
        let columns = table_columns(conn, &name)?.unwrap_or_default();
        tables.insert(name, columns);
    }

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'index' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let indexes = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(SchemaDescription {
        user_version,
        tables,
        indexes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::store::{self, HandleState};

    fn handle_with(sql: &str) -> Handle {
        let handle = Handle::create(LedgerConfig::default()).unwrap();
        handle
            .open_connection("test")
            .unwrap()
            .execute_batch(sql)
            .unwrap();
        handle
    }

    #[test]
    fn test_creates_tables_on_first_load() {
        let mut handle = Handle::create(LedgerConfig::default()).unwrap();
        ensure_schema(&mut handle).unwrap();

        assert_eq!(handle.state(), HandleState::SchemaReady);
        let description = describe_schema(&handle).unwrap();
        assert_eq!(description.user_version, SCHEMA_VERSION);
        assert_eq!(
            description.tables["accounts"],
            vec!["id", "name", "hidden"]
        );
        assert_eq!(
            description.tables["transactions"],
            vec!["id", "account_id", "amount", "timestamp", "memo"]
        );
        assert_eq!(description.indexes, vec!["idx_transactions_account_order"]);
    }

    #[test]
    fn test_ensure_twice_is_noop() {
        let mut handle = Handle::create(LedgerConfig::default()).unwrap();
        ensure_schema(&mut handle).unwrap();
        let once = describe_schema(&handle).unwrap();

        ensure_schema(&mut handle).unwrap();
        let twice = describe_schema(&handle).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn test_reopened_store_verifies_without_changes() {
        let mut handle = Handle::create(LedgerConfig::default()).unwrap();
        ensure_schema(&mut handle).unwrap();
        let before = describe_schema(&handle).unwrap();

        let mut reopened = store::open(&store::serialize(&handle).unwrap()).unwrap();
        assert_eq!(reopened.state(), HandleState::Opened);
        ensure_schema(&mut reopened).unwrap();

        assert_eq!(describe_schema(&reopened).unwrap(), before);
    }

    #[test]
    fn test_missing_column_fails() {
        let mut handle = handle_with("CREATE TABLE accounts (id INTEGER PRIMARY KEY, name TEXT)");

        let err = ensure_schema(&mut handle).unwrap_err();
        match err {
            LedgerError::SchemaError {
                table,
                expected,
                found,
                reason,
            } => {
                assert_eq!(table, "accounts");
                assert_eq!(expected, vec!["id", "name", "hidden"]);
                assert_eq!(found, vec!["id", "name"]);
                assert!(reason.contains("hidden"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(handle.state(), HandleState::Opened);
    }

    #[test]
    fn test_failed_ensure_leaves_store_untouched() {
        let mut handle = handle_with("CREATE TABLE transactions (id INTEGER PRIMARY KEY, amount INTEGER)");
        assert!(ensure_schema(&mut handle).is_err());

        let description = describe_schema(&handle).unwrap();
        assert_eq!(description.user_version, 0);
        assert!(!description.tables.contains_key("accounts"));
        assert!(description.indexes.is_empty());
    }

    #[test]
    fn test_extra_columns_and_partial_schema_accepted() {
        let mut handle = handle_with(
            "CREATE TABLE accounts (id INTEGER PRIMARY KEY, name TEXT, hidden INTEGER, placeholder INTEGER)",
        );
        ensure_schema(&mut handle).unwrap();

        let description = describe_schema(&handle).unwrap();
        assert!(description.tables["accounts"].contains(&"placeholder".to_string()));
        assert!(description.tables.contains_key("transactions"));
    }

    #[test]
    fn test_view_with_table_name_fails() {
        let mut handle = handle_with("CREATE VIEW accounts AS SELECT 1 AS id, 'x' AS name, 0 AS hidden");
        let err = ensure_schema(&mut handle).unwrap_err();
        assert!(matches!(err, LedgerError::SchemaError { ref table, .. } if table == "accounts"));
    }

    #[test]
    fn test_non_unique_transaction_id_fails() {
        let mut handle = handle_with(
            "CREATE TABLE transactions (id INTEGER, account_id INTEGER, amount INTEGER, timestamp TEXT, memo TEXT);
             INSERT INTO transactions VALUES (1, 1, 100, '2024-01-01 00:00:00', NULL);
             INSERT INTO transactions VALUES (1, 1, 100, '2024-01-01 00:00:00', NULL);",
        );

        let err = ensure_schema(&mut handle).unwrap_err();
        match err {
            LedgerError::SchemaError { table, reason, .. } => {
                assert_eq!(table, "transactions");
                assert!(reason.contains("no primary key"), "{}", reason);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(handle.state(), HandleState::Opened);
    }

    #[test]
    fn test_composite_or_text_key_fails() {
        for sql in [
            "CREATE TABLE accounts (id INTEGER, name TEXT, hidden INTEGER, PRIMARY KEY (id, name))",
            "CREATE TABLE accounts (id TEXT PRIMARY KEY, name TEXT, hidden INTEGER)",
        ] {
            let mut handle = handle_with(sql);
            let err = ensure_schema(&mut handle).unwrap_err();
            assert!(
                matches!(err, LedgerError::SchemaError { ref table, .. } if table == "accounts"),
                "{}: {:?}",
                sql,
                err
            );
        }
    }

    #[test]
    fn test_table_names_match_case_insensitively() {
        let mut handle = handle_with(
            "CREATE TABLE Accounts (id INTEGER PRIMARY KEY, name TEXT NOT NULL, hidden INTEGER NOT NULL DEFAULT 0);
             INSERT INTO Accounts VALUES (1, 'Cash', 0);",
        );
        ensure_schema(&mut handle).unwrap();

        let description = describe_schema(&handle).unwrap();
        assert!(description.tables.contains_key("Accounts"));
        assert!(!description.tables.contains_key("accounts"));
        assert_eq!(crate::db::get_account(&handle, 1).unwrap().name, "Cash");
    }

    #[test]
    fn test_incompatible_mixed_case_table_is_schema_error() {
        let mut handle = handle_with("CREATE TABLE TRANSACTIONS (id INTEGER PRIMARY KEY, amount INTEGER)");
        let err = ensure_schema(&mut handle).unwrap_err();
        assert!(matches!(err, LedgerError::SchemaError { ref table, .. } if table == "transactions"));
    }

    #[test]
    fn test_newer_schema_version_fails() {
        let mut handle = handle_with("PRAGMA user_version = 9");
        let err = ensure_schema(&mut handle).unwrap_err();
        assert!(matches!(err, LedgerError::SchemaError { .. }));
    }

    #[test]
    fn test_ensure_on_unopened_handle_is_not_ready() {
        let mut handle = Handle::unopened(LedgerConfig::default());
        let err = ensure_schema(&mut handle).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::NotReady {
                operation: "ensure_schema",
                state: HandleState::Unopened,
            }
        ));
    }
}

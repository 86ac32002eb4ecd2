// ⚖️ Balance Aggregator
// Derives per-account balances from transaction history. Nothing is stored:
// balances are a fold over transactions in (timestamp, id) order using exact
// integer minor units.
//
// The fold is additive, so folding in one pass or in any split of chunks
// gives the same result; the chunked reader only bounds memory per step.

use chrono::NaiveDateTime;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::db::{self, Transaction, TransactionRow, TRANSACTION_COLUMNS};
use crate::error::{LedgerError, Result};
use crate::store::Handle;

// ============================================================================
// BALANCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub account_id: i64,
    /// Sum of all amounts, in minor units
    pub amount: i64,
    pub transaction_count: u64,
    pub last_activity: Option<NaiveDateTime>,
}

impl Balance {
    pub fn zero(account_id: i64) -> Self {
        Balance {
            account_id,
            amount: 0,
            transaction_count: 0,
            last_activity: None,
        }
    }

    /// Add one transaction. The caller guarantees it belongs to this account.
    pub fn apply(&mut self, transaction: &Transaction) -> Result<()> {
        self.amount = self
            .amount
            .checked_add(transaction.amount)
            .ok_or(LedgerError::BalanceOverflow {
                account_id: self.account_id,
                transaction_id: transaction.id,
            })?;
        self.transaction_count += 1;
        self.last_activity = self.last_activity.max(Some(transaction.timestamp));
        Ok(())
    }

    /// Amount in major units, e.g. "75.00"
    pub fn display_amount(&self) -> String {
        db::format_minor_units(self.amount)
    }
}

/// One row of an account register: a transaction and the balance after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningBalance {
    pub transaction: Transaction,
    pub balance: i64,
}

// ============================================================================
// AGGREGATOR
// ============================================================================

/// Incremental fold of transactions into per-account balances.
///
/// Every known account starts at zero. A transaction for an account that was
/// not registered is an `UnknownAccountReference`.
#[derive(Debug, Clone, Default)]
pub struct BalanceAggregator {
    balances: BTreeMap<i64, Balance>,
}

impl BalanceAggregator {
    pub fn new(account_ids: impl IntoIterator<Item = i64>) -> Self {
        BalanceAggregator {
            balances: account_ids
                .into_iter()
                .map(|id| (id, Balance::zero(id)))
                .collect(),
        }
    }

    pub fn apply(&mut self, transaction: &Transaction) -> Result<()> {
        let balance = self.balances.get_mut(&transaction.account_id).ok_or(
            LedgerError::UnknownAccountReference {
                transaction_id: transaction.id,
                account_id: transaction.account_id,
            },
        )?;
        balance.apply(transaction)
    }

    pub fn apply_chunk(&mut self, transactions: &[Transaction]) -> Result<()> {
        transactions.iter().try_for_each(|tx| self.apply(tx))
    }

    pub fn balance(&self, account_id: i64) -> Option<&Balance> {
        self.balances.get(&account_id)
    }

    pub fn finish(self) -> BTreeMap<i64, Balance> {
        self.balances
    }
}

/// Pure one-pass aggregation over in-memory rows.
pub fn aggregate(
    account_ids: impl IntoIterator<Item = i64>,
    transactions: &[Transaction],
) -> Result<BTreeMap<i64, Balance>> {
    let mut aggregator = BalanceAggregator::new(account_ids);
    aggregator.apply_chunk(transactions)?;
    Ok(aggregator.finish())
}

// ============================================================================
// STORE-BACKED AGGREGATION
// ============================================================================

/// Balance for every account in the store, keyed by account id.
pub fn compute_balances(handle: &Handle) -> Result<BTreeMap<i64, Balance>> {
    fold_store(handle, "compute_balances", None)
}

/// Balances counting only transactions at or before `cutoff`.
pub fn balances_as_of(handle: &Handle, cutoff: NaiveDateTime) -> Result<BTreeMap<i64, Balance>> {
    fold_store(handle, "balances_as_of", Some(cutoff))
}

/// The account's transactions in (timestamp, id) order with the balance after each.
pub fn running_balances(handle: &Handle, account_id: i64) -> Result<Vec<RunningBalance>> {
    let transactions = db::transactions_for_account(handle, account_id)?;

    let mut balance = Balance::zero(account_id);
    let mut register = Vec::with_capacity(transactions.len());
    for transaction in transactions {
        balance.apply(&transaction)?;
        register.push(RunningBalance {
            transaction,
            balance: balance.amount,
        });
    }
    Ok(register)
}

fn fold_store(
    handle: &Handle,
    operation: &'static str,
    cutoff: Option<NaiveDateTime>,
) -> Result<BTreeMap<i64, Balance>> {
    let conn = handle.ready_connection(operation)?;
    let chunk_size = handle.config().aggregation_chunk_size;
    debug_assert!(chunk_size > 0, "config validation rejects a zero chunk size");

    let mut stmt = conn.prepare("SELECT id FROM accounts")?;
    let account_ids = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut aggregator = BalanceAggregator::new(account_ids);

    let mut first_chunk = conn.prepare(&format!(
        "SELECT {} FROM transactions ORDER BY timestamp, id LIMIT ?1",
        TRANSACTION_COLUMNS
    ))?;
    let mut next_chunk = conn.prepare(&format!(
        "SELECT {} FROM transactions
         WHERE timestamp > ?1 OR (timestamp = ?1 AND id > ?2)
         ORDER BY timestamp, id LIMIT ?3",
        TRANSACTION_COLUMNS
    ))?;

    // Keyset cursor: (timestamp text, id) of the last row folded
    let mut cursor: Option<(String, i64)> = None;
    let mut chunks = 0usize;
    let mut folded = 0usize;
    loop {
        let rows = match &cursor {
            None => first_chunk
                .query_map(params![chunk_size as i64], TransactionRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            Some((timestamp, id)) => next_chunk
                .query_map(
                    params![timestamp, id, chunk_size as i64],
                    TransactionRow::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        let Some(last) = rows.last() else {
            break;
        };
        cursor = Some((last.timestamp.clone(), last.id));
        let row_count = rows.len();

        let transactions = rows
            .into_iter()
            .map(TransactionRow::into_transaction)
            .collect::<Result<Vec<_>>>()?;
        let in_range: Vec<Transaction> = match cutoff {
            Some(cutoff) => transactions
                .into_iter()
                .filter(|tx| tx.timestamp <= cutoff)
                .collect(),
            None => transactions,
        };
        aggregator.apply_chunk(&in_range)?;

        chunks += 1;
        folded += in_range.len();
        debug!(chunk = chunks, rows = row_count, "folded transaction chunk");

        if row_count < chunk_size {
            break;
        }
    }

    let balances = aggregator.finish();
    info!(accounts = balances.len(), transactions = folded, chunks, "computed balances");
    Ok(balances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::db::{insert_account, insert_transaction, parse_timestamp, NewTransaction};
    use crate::schema::ensure_schema;
    use crate::store::HandleState;
    use proptest::prelude::*;

    fn ts(text: &str) -> NaiveDateTime {
        parse_timestamp(text).unwrap()
    }

    fn ready_handle(chunk_size: usize) -> Handle {
        let config = LedgerConfig::default().with_chunk_size(chunk_size);
        let mut handle = Handle::create(config).unwrap();
        ensure_schema(&mut handle).unwrap();
        handle
    }

    fn tx(id: i64, account_id: i64, amount: i64, when: &str) -> Transaction {
        Transaction {
            id,
            account_id,
            amount,
            timestamp: ts(when),
            memo: None,
        }
    }

    /// Store with one account holding +100, -30, +5 minor units
    fn seeded_handle(chunk_size: usize) -> (Handle, i64) {
        let mut handle = ready_handle(chunk_size);
        let account = insert_account(&mut handle, "Checking", false).unwrap();
        for (amount, when) in [
            (100, "2024-01-01 09:00:00"),
            (-30, "2024-01-02 09:00:00"),
            (5, "2024-01-03 09:00:00"),
        ] {
            insert_transaction(&mut handle, NewTransaction::new(account.id, amount, ts(when))).unwrap();
        }
        (handle, account.id)
    }

    #[test]
    fn test_balance_one_pass_and_chunked() {
        for chunk_size in [1, 2, 500] {
            let (handle, account_id) = seeded_handle(chunk_size);
            let balances = compute_balances(&handle).unwrap();
            assert_eq!(balances[&account_id].amount, 75, "chunk size {}", chunk_size);
            assert_eq!(balances[&account_id].transaction_count, 3);
            assert_eq!(
                balances[&account_id].last_activity,
                Some(ts("2024-01-03 09:00:00"))
            );
        }
    }

    #[test]
    fn test_incremental_matches_recompute() {
        let transactions = vec![
            tx(1, 1, 100, "2024-01-01 00:00:00"),
            tx(2, 1, -30, "2024-01-02 00:00:00"),
            tx(3, 1, 5, "2024-01-03 00:00:00"),
        ];

        let mut incremental = BalanceAggregator::new([1]);
        incremental.apply_chunk(&transactions[..1]).unwrap();
        incremental.apply_chunk(&transactions[1..]).unwrap();

        assert_eq!(incremental.finish(), aggregate([1], &transactions).unwrap());
    }

    #[test]
    fn test_accounts_without_transactions_are_zero() {
        let (mut handle, _) = seeded_handle(500);
        let empty = insert_account(&mut handle, "Empty", true).unwrap();

        let balances = compute_balances(&handle).unwrap();
        assert_eq!(balances[&empty.id], Balance::zero(empty.id));
    }

    #[test]
    fn test_same_timestamp_folds_in_id_order() {
        let mut handle = ready_handle(1);
        let account = insert_account(&mut handle, "Cash", false).unwrap();
        for (id, amount) in [(30, 3), (10, 1), (20, 2)] {
            insert_transaction(
                &mut handle,
                NewTransaction::new(account.id, amount, ts("2024-05-05 12:00:00")).with_id(id),
            )
            .unwrap();
        }

        let first = running_balances(&handle, account.id).unwrap();
        let ids: Vec<i64> = first.iter().map(|row| row.transaction.id).collect();
        let running: Vec<i64> = first.iter().map(|row| row.balance).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert_eq!(running, vec![1, 3, 6]);

        for _ in 0..3 {
            assert_eq!(running_balances(&handle, account.id).unwrap(), first);
        }
    }

    #[test]
    fn test_dangling_reference_fails_without_mutation() {
        let (handle, _) = seeded_handle(2);
        handle
            .ready_connection("test")
            .unwrap()
            .execute(
                "INSERT INTO transactions (id, account_id, amount, timestamp) VALUES (99, 404, 1, '2024-02-01 00:00:00')",
                [],
            )
            .unwrap();
        let accounts_before = db::all_accounts(&handle).unwrap();
        let rows_before = db::all_transactions(&handle).unwrap();

        let err = compute_balances(&handle).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::UnknownAccountReference {
                transaction_id: 99,
                account_id: 404
            }
        ));

        assert_eq!(db::all_accounts(&handle).unwrap(), accounts_before);
        assert_eq!(db::all_transactions(&handle).unwrap(), rows_before);
    }

    #[test]
    fn test_overflow_is_reported() {
        let transactions = vec![
            tx(1, 1, i64::MAX, "2024-01-01 00:00:00"),
            tx(2, 1, 1, "2024-01-02 00:00:00"),
        ];
        let err = aggregate([1], &transactions).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::BalanceOverflow {
                account_id: 1,
                transaction_id: 2
            }
        ));
    }

    #[test]
    fn test_balances_as_of() {
        let (handle, account_id) = seeded_handle(2);
        let balances = balances_as_of(&handle, ts("2024-01-02 09:00:00")).unwrap();
        assert_eq!(balances[&account_id].amount, 70);
        assert_eq!(balances[&account_id].transaction_count, 2);

        let before_anything = balances_as_of(&handle, ts("2023-12-31 00:00:00")).unwrap();
        assert_eq!(before_anything[&account_id], Balance::zero(account_id));
    }

    #[test]
    fn test_running_balances_for_missing_account() {
        let (handle, _) = seeded_handle(500);
        assert!(matches!(
            running_balances(&handle, 404).unwrap_err(),
            LedgerError::AccountNotFound(404)
        ));
    }

    #[test]
    fn test_not_ready_before_schema() {
        let handle = Handle::create(LedgerConfig::default()).unwrap();
        assert!(matches!(
            compute_balances(&handle).unwrap_err(),
            LedgerError::NotReady {
                operation: "compute_balances",
                state: HandleState::Opened
            }
        ));
    }

    #[test]
    fn test_zero_chunk_size_never_reaches_the_fold() {
        let config = LedgerConfig::default().with_chunk_size(0);
        assert!(matches!(
            Handle::create(config.clone()).unwrap_err(),
            LedgerError::Config(_)
        ));
        let bytes = crate::store::serialize(&ready_handle(500)).unwrap();
        assert!(matches!(
            crate::store::open_with_config(&bytes, config).unwrap_err(),
            LedgerError::Config(_)
        ));
    }

    #[test]
    fn test_display_amount() {
        let mut balance = Balance::zero(1);
        balance.apply(&tx(1, 1, -1234, "2024-01-01 00:00:00")).unwrap();
        assert_eq!(balance.display_amount(), "-12.34");
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_balances(
            rows in prop::collection::vec((1i64..4, -1_000_000i64..1_000_000, 0u32..5), 0..80),
            split in 1usize..16,
        ) {
            let transactions: Vec<Transaction> = rows
                .iter()
                .enumerate()
                .map(|(i, (account_id, amount, day))| Transaction {
                    id: i as i64 + 1,
                    account_id: *account_id,
                    amount: *amount,
                    timestamp: ts("2024-01-01 00:00:00") + chrono::Duration::days(*day as i64),
                    memo: None,
                })
                .collect();

            let one_pass = aggregate([1, 2, 3], &transactions).unwrap();

            let mut chunked = BalanceAggregator::new([1, 2, 3]);
            for chunk in transactions.chunks(split) {
                chunked.apply_chunk(chunk).unwrap();
            }
            prop_assert_eq!(chunked.finish(), one_pass.clone());

            for account_id in 1..4 {
                let expected: i64 = transactions
                    .iter()
                    .filter(|tx| tx.account_id == account_id)
                    .map(|tx| tx.amount)
                    .sum();
                prop_assert_eq!(one_pass[&account_id].amount, expected);
            }
        }

        #[test]
        fn prop_store_chunk_size_does_not_change_balances(
            amounts in prop::collection::vec(-10_000i64..10_000, 1..25),
            chunk_size in 1usize..8,
        ) {
            let mut small = ready_handle(chunk_size);
            let mut large = ready_handle(500);
            for handle in [&mut small, &mut large] {
                let account = insert_account(handle, "A", false).unwrap();
                for (i, amount) in amounts.iter().enumerate() {
                    // Pairs of rows share a timestamp to exercise the id tie-break
                    let when = ts("2024-01-01 00:00:00") + chrono::Duration::hours(i as i64 / 2);
                    insert_transaction(handle, NewTransaction::new(account.id, *amount, when)).unwrap();
                }
            }

            prop_assert_eq!(
                compute_balances(&small).unwrap(),
                compute_balances(&large).unwrap()
            );
        }
    }
}

// Account Query Service
// Read-only account listings filtered by hidden flag and a LIKE-style name
// pattern, joined with computed balances.

use chrono::NaiveDateTime;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::balance::{compute_balances, Balance};
use crate::db::Account;
use crate::error::Result;
use crate::store::Handle;

// ============================================================================
// LIKE PATTERN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// `%`: any sequence, including empty
    AnySequence,
    /// `_`: exactly one character
    AnyChar,
    Literal(char),
}

/// SQL LIKE pattern: `%` matches any sequence, `_` any single character,
/// and `\` escapes the next character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikePattern {
    tokens: Vec<Token>,
    case_sensitive: bool,
}

impl LikePattern {
    pub fn new(pattern: &str, case_sensitive: bool) -> Self {
        let mut tokens = Vec::new();
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '%' => {
                    // Consecutive `%` are equivalent to one
                    if tokens.last() != Some(&Token::AnySequence) {
                        tokens.push(Token::AnySequence);
                    }
                }
                '_' => tokens.push(Token::AnyChar),
                '\\' => {
                    let literal = chars.next().unwrap_or('\\');
                    push_literal(&mut tokens, literal, case_sensitive);
                }
                other => push_literal(&mut tokens, other, case_sensitive),
            }
        }
        LikePattern {
            tokens,
            case_sensitive,
        }
    }

    pub fn is_match(&self, text: &str) -> bool {
        let text: Vec<char> = if self.case_sensitive {
            text.chars().collect()
        } else {
            text.chars().flat_map(char::to_lowercase).collect()
        };

        let (mut t, mut p) = (0, 0);
        // Position after the last `%` seen, and the text index it is currently absorbing up to
        let mut backtrack: Option<(usize, usize)> = None;

        while t < text.len() {
            match self.tokens.get(p) {
                Some(Token::AnyChar) => {
                    t += 1;
                    p += 1;
                }
                Some(Token::Literal(c)) if *c == text[t] => {
                    t += 1;
                    p += 1;
                }
                Some(Token::AnySequence) => {
                    p += 1;
                    backtrack = Some((p, t));
                }
                _ => match backtrack {
                    Some((after_any, absorbed)) => {
                        p = after_any;
                        t = absorbed + 1;
                        backtrack = Some((after_any, absorbed + 1));
                    }
                    None => return false,
                },
            }
        }

        self.tokens[p..]
            .iter()
            .all(|token| *token == Token::AnySequence)
    }
}

fn push_literal(tokens: &mut Vec<Token>, c: char, case_sensitive: bool) {
    if case_sensitive {
        tokens.push(Token::Literal(c));
    } else {
        tokens.extend(c.to_lowercase().map(Token::Literal));
    }
}

// ============================================================================
// FILTER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFilter {
    /// Exact match on the hidden flag
    pub hidden: bool,
    /// LIKE pattern on the account name
    pub name_pattern: String,
    /// Overrides the handle's configured collation when set
    #[serde(default)]
    pub case_sensitive: Option<bool>,
}

impl AccountFilter {
    pub fn visible(name_pattern: &str) -> Self {
        AccountFilter {
            hidden: false,
            name_pattern: name_pattern.to_string(),
            case_sensitive: None,
        }
    }

    pub fn hidden(name_pattern: &str) -> Self {
        AccountFilter {
            hidden: true,
            name_pattern: name_pattern.to_string(),
            case_sensitive: None,
        }
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = Some(case_sensitive);
        self
    }
}

impl Default for AccountFilter {
    fn default() -> Self {
        AccountFilter::visible("%")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account: Account,
    pub balance: Balance,
}

// ============================================================================
// QUERIES
// ============================================================================

/// Accounts matching `filter`, ordered by id, each with its computed balance.
/// No match yields an empty list.
pub fn list_accounts(handle: &Handle, filter: &AccountFilter) -> Result<Vec<AccountBalance>> {
    let conn = handle.ready_connection("list_accounts")?;
    let case_sensitive = filter
        .case_sensitive
        .unwrap_or(handle.config().case_sensitive_names);
    let pattern = LikePattern::new(&filter.name_pattern, case_sensitive);

    let mut stmt =
        conn.prepare("SELECT id, name, hidden FROM accounts WHERE (hidden != 0) = ?1 ORDER BY id")?;
    let candidates = stmt
        .query_map(params![filter.hidden], |row| {
            Ok(Account {
                id: row.get(0)?,
                name: row.get(1)?,
                hidden: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let balances = compute_balances(handle)?;
    let matched: Vec<AccountBalance> = candidates
        .into_iter()
        .filter(|account| pattern.is_match(&account.name))
        .map(|account| {
            let balance = balances
                .get(&account.id)
                .copied()
                .unwrap_or_else(|| Balance::zero(account.id));
            AccountBalance { account, balance }
        })
        .collect();

    debug!(
        hidden = filter.hidden,
        pattern = %filter.name_pattern,
        case_sensitive,
        matched = matched.len(),
        "listed accounts"
    );
    Ok(matched)
}

/// Matching accounts with at least one transaction at or after `since`.
pub fn accounts_with_activity_since(
    handle: &Handle,
    since: NaiveDateTime,
    filter: &AccountFilter,
) -> Result<Vec<AccountBalance>> {
    let accounts = list_accounts(handle, filter)?;
    Ok(accounts
        .into_iter()
        .filter(|row| row.balance.last_activity.is_some_and(|last| last >= since))
        .collect())
}

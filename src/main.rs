use anyhow::{bail, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use money_ledger::{
    compute_balances, ensure_schema, format_minor_units, import_accounts_csv,
    import_transactions_csv, list_accounts, load, rename_account, running_balances, serialize,
    set_hidden, AccountFilter, Handle, LedgerConfig,
};

const USAGE: &str = "usage: money-ledger [--config FILE] [--verbose] <command>

commands:
  import <accounts.csv> <transactions.csv> [out.db]
  list <store.db> [--hidden] [--pattern PATTERN] [--case-sensitive]
  balances <store.db>
  register <store.db> <account_id>
  hide <store.db> <account_id>
  unhide <store.db> <account_id>
  rename <store.db> <account_id> <name>";

fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();

    let verbose = take_flag(&mut args, "--verbose");
    init_logging(verbose);

    let config = match take_option(&mut args, "--config")? {
        Some(path) => LedgerConfig::load(Path::new(&path))
            .with_context(|| format!("Failed to load config '{}'", path))?,
        None => LedgerConfig::default(),
    };

    let Some(command) = args.first().cloned() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };
    let rest = &args[1..];

    match command.as_str() {
        "import" => run_import(rest, &config),
        "list" => run_list(rest, &config),
        "balances" => run_balances(rest, &config),
        "register" => run_register(rest, &config),
        "hide" => run_set_hidden(rest, &config, true),
        "unhide" => run_set_hidden(rest, &config, false),
        "rename" => run_rename(rest, &config),
        other => {
            eprintln!("unknown command '{}'\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// COMMANDS
// ============================================================================

fn run_import(args: &[String], config: &LedgerConfig) -> Result<()> {
    let [accounts_csv, transactions_csv, rest @ ..] = args else {
        bail!("import needs <accounts.csv> <transactions.csv> [out.db]");
    };
    let out_path = rest
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&config.export_file_name));

    let mut handle = Handle::create(config.clone())?;
    ensure_schema(&mut handle)?;

    let accounts = fs::File::open(accounts_csv)
        .with_context(|| format!("Failed to open '{}'", accounts_csv))?;
    let account_count = import_accounts_csv(&mut handle, accounts)?;

    let transactions = fs::File::open(transactions_csv)
        .with_context(|| format!("Failed to open '{}'", transactions_csv))?;
    let transaction_count = import_transactions_csv(&mut handle, transactions)?;

    // Fail before writing anything if the imported ledger does not aggregate
    compute_balances(&handle).context("Imported ledger is inconsistent")?;

    write_store(&handle, &out_path)?;
    println!(
        "✓ Imported {} accounts and {} transactions into {}",
        account_count,
        transaction_count,
        out_path.display()
    );
    Ok(())
}

fn run_list(args: &[String], config: &LedgerConfig) -> Result<()> {
    let mut args = args.to_vec();
    let hidden = take_flag(&mut args, "--hidden");
    let case_sensitive = take_flag(&mut args, "--case-sensitive");
    let pattern = take_option(&mut args, "--pattern")?.unwrap_or_else(|| "%".to_string());
    let [store_path] = args.as_slice() else {
        bail!("list needs exactly one <store.db>");
    };

    let handle = read_store(Path::new(store_path), config)?;
    let mut filter = AccountFilter {
        hidden,
        name_pattern: pattern,
        case_sensitive: None,
    };
    if case_sensitive {
        filter = filter.case_sensitive(true);
    }

    for row in list_accounts(&handle, &filter)? {
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}

fn run_balances(args: &[String], config: &LedgerConfig) -> Result<()> {
    let [store_path] = args else {
        bail!("balances needs exactly one <store.db>");
    };

    let handle = read_store(Path::new(store_path), config)?;
    for (account_id, balance) in compute_balances(&handle)? {
        println!(
            "{:>6}  {:>14}  ({} transactions)",
            account_id,
            balance.display_amount(),
            balance.transaction_count
        );
    }
    Ok(())
}

fn run_register(args: &[String], config: &LedgerConfig) -> Result<()> {
    let [store_path, account_id] = args else {
        bail!("register needs <store.db> <account_id>");
    };
    let account_id = parse_account_id(account_id)?;

    let handle = read_store(Path::new(store_path), config)?;
    for row in running_balances(&handle, account_id)? {
        println!(
            "{}  {:>12}  {:>14}  {}",
            money_ledger::format_timestamp(&row.transaction.timestamp),
            format_minor_units(row.transaction.amount),
            format_minor_units(row.balance),
            row.transaction.memo.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn run_set_hidden(args: &[String], config: &LedgerConfig, hidden: bool) -> Result<()> {
    let [store_path, account_id] = args else {
        bail!("hide/unhide needs <store.db> <account_id>");
    };
    let account_id = parse_account_id(account_id)?;
    let path = Path::new(store_path);

    let mut handle = read_store(path, config)?;
    set_hidden(&mut handle, account_id, hidden)?;
    write_store(&handle, path)?;
    println!(
        "✓ Account {} is now {}",
        account_id,
        if hidden { "hidden" } else { "visible" }
    );
    Ok(())
}

fn run_rename(args: &[String], config: &LedgerConfig) -> Result<()> {
    let [store_path, account_id, name] = args else {
        bail!("rename needs <store.db> <account_id> <name>");
    };
    let account_id = parse_account_id(account_id)?;
    let path = Path::new(store_path);

    let mut handle = read_store(path, config)?;
    rename_account(&mut handle, account_id, name)?;
    write_store(&handle, path)?;
    println!("✓ Account {} renamed to '{}'", account_id, name);
    Ok(())
}

// ============================================================================
// HELPERS
// ============================================================================

fn read_store(path: &Path, config: &LedgerConfig) -> Result<Handle> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read '{}'", path.display()))?;
    let handle = load(&bytes, config.clone())
        .with_context(|| format!("Failed to load store '{}'", path.display()))?;
    Ok(handle)
}

fn write_store(handle: &Handle, path: &Path) -> Result<()> {
    let bytes = serialize(handle)?;
    fs::write(path, bytes).with_context(|| format!("Failed to write '{}'", path.display()))?;
    Ok(())
}

fn parse_account_id(text: &str) -> Result<i64> {
    text.parse()
        .with_context(|| format!("'{}' is not a valid account id", text))
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|arg| arg != flag);
    args.len() != before
}

fn take_option(args: &mut Vec<String>, option: &str) -> Result<Option<String>> {
    let Some(index) = args.iter().position(|arg| arg == option) else {
        return Ok(None);
    };
    if index + 1 >= args.len() {
        bail!("{} needs a value", option);
    }
    let value = args.remove(index + 1);
    args.remove(index);
    Ok(Some(value))
}

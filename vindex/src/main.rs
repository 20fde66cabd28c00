// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

//! `vindex-inspect`: open an index log file, report its shape, check its
//! invariants and optionally run one query or bulk load.
//!
//! ```text
//! vindex-inspect                  shape and invariant check only
//! vindex-inspect get VALUE        identifiers under VALUE
//! vindex-inspect top K            K smallest entries
//! vindex-inspect range MIN MAX K  up to K entries in [MIN, MAX]
//! vindex-inspect load FILE        bulk load `VALUE IDENTIFIER` lines and commit
//! vindex-inspect compact          rewrite the log down to its live records
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vindex::config::IndexConfig;
use vindex::index::{
    BulkLoader, Database, ExtractError, ExtractTask, Identifier, LeafEntry, Tree, TreeError, Value,
    check_invariants,
};
use vindex::storage::FileStore;

/// A command given on the command line.
enum Query {
    Get(Value),
    Top(usize),
    Range(Value, Value, usize),
    Load(PathBuf),
    Compact,
}

fn parse_u64(arg: Option<&String>, what: &str) -> Result<u64, String> {
    let arg = arg.ok_or_else(|| format!("missing {what}"))?;
    arg.parse()
        .map_err(|_| format!("{what} '{arg}' is not an unsigned integer"))
}

fn parse_usize(arg: Option<&String>, what: &str) -> Result<usize, String> {
    let n = parse_u64(arg, what)?;
    usize::try_from(n).map_err(|_| format!("{what} {n} is too large"))
}

fn parse_query(args: &[String]) -> Result<Option<Query>, String> {
    let Some(command) = args.first() else {
        return Ok(None);
    };
    let query = match command.as_str() {
        "get" => Query::Get(Value::from_u64(parse_u64(args.get(1), "value")?)),
        "top" => Query::Top(parse_usize(args.get(1), "k")?),
        "range" => Query::Range(
            Value::from_u64(parse_u64(args.get(1), "min")?),
            Value::from_u64(parse_u64(args.get(2), "max")?),
            parse_usize(args.get(3), "k")?,
        ),
        "load" => Query::Load(PathBuf::from(args.get(1).ok_or("missing file")?)),
        "compact" => Query::Compact,
        other => {
            return Err(format!(
                "unknown command '{other}' (expected get, top, range, load or compact)"
            ));
        }
    };
    Ok(Some(query))
}

fn print_entries(entries: &[LeafEntry]) {
    for entry in entries {
        println!("{}\t{} identifiers", entry.value, entry.identifiers.len());
    }
}

/// Parse one `VALUE IDENTIFIER` line.
fn parse_pair(line: &str) -> Result<(Value, Identifier), ExtractError> {
    let (value, identifier) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("expected 'VALUE IDENTIFIER', got '{line}'"))?;
    let value: u64 = value
        .parse()
        .map_err(|_| format!("value '{value}' is not an unsigned integer"))?;
    Ok((Value::from_u64(value), identifier.trim().as_bytes().to_vec()))
}

/// Split the non-empty lines of `input` into one extraction task per worker.
fn load_tasks(input: &str, workers: usize) -> Vec<ExtractTask> {
    let lines: Vec<String> = input
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    let chunk = lines.len().div_ceil(workers).max(1);
    lines
        .chunks(chunk)
        .map(|chunk| {
            let chunk = chunk.to_vec();
            let task: ExtractTask =
                Box::new(move || -> Result<Vec<(Value, Identifier)>, ExtractError> {
                    chunk.iter().map(String::as_str).map(parse_pair).collect()
                });
            task
        })
        .collect()
}

fn run_load(tree: &mut Tree<FileStore>, config: &IndexConfig, path: &Path) -> Result<(), String> {
    let input = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let report = BulkLoader::new(config.workers)
        .with_cache_limit(config.cache_limit)
        .load(tree, load_tasks(&input, config.workers))
        .map_err(|e| format!("Bulk load failed: {e}"))?;
    let root = tree.commit().map_err(|e| format!("Commit failed: {e}"))?;
    tracing::info!(
        "loaded {} pairs ({} values) from {}, root {root}",
        report.pairs,
        report.entries,
        path.display()
    );
    Ok(())
}

fn run_query(tree: &Tree<FileStore>, query: Query) -> Result<(), TreeError> {
    match query {
        Query::Get(value) => match tree.specific_search(&value)? {
            Some(ids) => {
                for id in ids {
                    println!("{}", String::from_utf8_lossy(&id));
                }
            }
            None => println!("{value}: not found"),
        },
        Query::Top(k) => match tree.topk_search(k) {
            Ok(entries) => print_entries(&entries),
            Err(TreeError::InsufficientResults { requested, partial }) => {
                tracing::warn!("only {} of {requested} entries exist", partial.len());
                print_entries(&partial);
            }
            Err(e) => return Err(e),
        },
        Query::Range(min, max, k) => print_entries(&tree.range_search(&min, &max, k)?),
        Query::Load(_) | Query::Compact => {}
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vindex=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let query = match parse_query(&args) {
        Ok(query) => query,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Load configuration from environment variables
    let config = match IndexConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (store, recovery) = match FileStore::open_with_stats(&config.data_file) {
        Ok(opened) => opened,
        Err(e) => {
            tracing::error!("Failed to open {}: {e}", config.data_file.display());
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        "opened {}: {} records, {} bytes of torn tail dropped",
        config.data_file.display(),
        recovery.records,
        recovery.truncated_bytes
    );

    if matches!(query, Some(Query::Compact))
        && let Err(e) = store.compact()
    {
        tracing::error!("Failed to compact {}: {e}", config.data_file.display());
        return ExitCode::FAILURE;
    }

    let mut tree = match Tree::open_latest(Arc::new(Database::new(store)), config.tree_config()) {
        Ok(tree) => tree,
        Err(e) => {
            tracing::error!("Failed to open tree: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(Query::Load(path)) = &query
        && let Err(e) = run_load(&mut tree, &config, path)
    {
        tracing::error!("{e}");
        return ExitCode::FAILURE;
    }

    match tree.shape() {
        Ok(shape) => tracing::info!(
            "depth {}, {} leaves, {} internal nodes, {} values, {} identifiers ({} special), {:.1} entries per leaf",
            shape.depth,
            shape.leaves,
            shape.internals,
            shape.entries,
            shape.identifiers,
            shape.special_identifiers,
            shape.average_leaf_fanout()
        ),
        Err(e) => {
            tracing::error!("Failed to walk tree: {e}");
            return ExitCode::FAILURE;
        }
    }

    match check_invariants(&tree) {
        Ok(violations) if violations.is_empty() => tracing::info!("all invariants hold"),
        Ok(violations) => {
            for violation in &violations {
                tracing::error!("invariant violated: {violation}");
            }
            return ExitCode::FAILURE;
        }
        Err(e) => {
            tracing::error!("Failed to check invariants: {e}");
            return ExitCode::FAILURE;
        }
    }

    if let Some(query) = query
        && let Err(e) = run_query(&tree, query)
    {
        tracing::error!("Query failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

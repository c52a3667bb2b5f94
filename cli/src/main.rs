use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Args, Parser, Subcommand};
use futures_util::future::join_all;
use opentsdb_finder::config::normalize_uri;
use opentsdb_finder::{FindQuery, Finder, FinderConfig, FinderError, NodeKind};
use serde_json::{Value, json};

const DEFAULT_WINDOW_SECS: i64 = 3600;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{code}: {source}")]
    Finder { code: &'static str, source: FinderError },
    #[error("invalid window: start {start} is not before end {end}")]
    InvalidWindow { start: i64, end: i64 },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl From<FinderError> for CliError {
    fn from(source: FinderError) -> Self {
        Self::Finder { code: source.error_code(), source }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tsdb-find", about = "Resolve glob patterns against an OpenTSDB tree")]
struct Cli {
    /// Overrides `OPENTSDB_URI`.
    #[arg(long)]
    uri: Option<String>,

    /// Overrides `OPENTSDB_TREE`.
    #[arg(long)]
    tree: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every node matching a pattern, one per line.
    Find { pattern: String },
    /// Print the aligned series of every matching leaf as JSON lines.
    Fetch(FetchArgs),
}

#[derive(Args, Debug)]
struct FetchArgs {
    pattern: String,

    /// Window start, unix seconds. Defaults to one hour before `--end`.
    #[arg(long)]
    start: Option<i64>,

    /// Window end, unix seconds. Defaults to now.
    #[arg(long)]
    end: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = FinderConfig::from_env()?;
    if let Some(uri) = cli.uri.as_deref() {
        config.uri = normalize_uri(uri)?;
    }
    if let Some(tree) = cli.tree {
        config.tree = tree;
    }
    let finder = Finder::new(config)?;

    match cli.command {
        Command::Find { pattern } => run_find(&finder, pattern).await,
        Command::Fetch(args) => run_fetch(&finder, args).await,
    }
}

async fn run_find(finder: &Finder, pattern: String) -> Result<(), CliError> {
    for node in finder.find_nodes(&FindQuery::new(pattern)).await? {
        match node.kind {
            NodeKind::Branch { branch_id } => println!("branch {} {branch_id}", node.path),
            NodeKind::Leaf(reader) => println!("leaf   {} {}", node.path, reader.leaf().tsuid),
        }
    }
    Ok(())
}

async fn run_fetch(finder: &Finder, args: FetchArgs) -> Result<(), CliError> {
    let end = args.end.unwrap_or_else(now_secs);
    let start = args.start.unwrap_or(end - DEFAULT_WINDOW_SECS);
    if start >= end {
        return Err(CliError::InvalidWindow { start, end });
    }

    let query = FindQuery::new(args.pattern).with_window(start, end);
    let leaves: Vec<_> = finder
        .find_nodes(&query)
        .await?
        .filter_map(|node| match node.kind {
            NodeKind::Leaf(reader) => Some((node.path, reader)),
            NodeKind::Branch { .. } => None,
        })
        .collect();

    let fetches = leaves.iter().map(|(_, reader)| reader.fetch(start, end));
    let results = join_all(fetches).await;

    for ((path, _), result) in leaves.iter().zip(results) {
        let line = match result {
            Ok(series) => json!({ "path": path, "series": series }),
            Err(e) => json!({ "path": path, "error": { "code": e.error_code(), "message": e.to_string() } }),
        };
        print_json_line(&line)?;
    }
    Ok(())
}

fn now_secs() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_secs()).unwrap_or(0)
}

fn print_json_line(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}

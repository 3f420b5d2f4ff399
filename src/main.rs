//! # Kibana Harness CLI (`kh`)
//!
//! The `kh` binary runs time-windowed log queries against Kibana, caches
//! results by query fingerprint, and summarizes logs with the configured
//! analysis provider. Output is JSON on stdout; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! kh --config ./config/kh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kh search` | Search logs in the active index |
//! | `kh summarize` | Search, then analyze the records (chunked above the threshold) |
//! | `kh errors` | Error, fatal and critical records, newest first |
//! | `kh stats` | Count values of one field and report the error rate |
//! | `kh recent` | The newest records, optionally at one level |
//! | `kh session-id <order>` | Find the payment session id logged for an order |
//! | `kh indexes` | List index patterns known to Kibana |
//! | `kh use-index <pattern>` | Select the active index for later commands |
//! | `kh config` | Print the effective configuration, token masked |
//! | `kh completions <shell>` | Print a shell completion script |
//!
//! ## Examples
//!
//! ```bash
//! kh use-index 'logs-app-*'
//! kh search --query 'status:500' --time-filter 24h --level error
//! kh search --start 2024-06-01T00:00:00Z --end 2024-06-01T06:00:00Z
//! kh summarize --time-filter 2h --function-mode
//! kh errors --time-filter 6h --limit 25 --no-stack-traces
//! kh stats --group-by service
//! kh session-id ORD-1234
//! kh --set cache.search_ttl_secs=30 search --query timeout
//! ```

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use kibana_harness::config::{self, Config};
use kibana_harness::service::{ErrorQuery, LogService, RecentQuery, SearchRequest, StatsQuery};
use kibana_harness::session::Session;
use kibana_harness_core::time_filter::{RawTimeFilter, TimeParams};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Kibana Harness: cached, retrying log queries with AI summaries.
#[derive(Parser)]
#[command(name = "kh", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kh.toml")]
    config: PathBuf,

    /// Session state file holding the active index.
    #[arg(long, global = true, default_value = "./.kh-session.json")]
    session: PathBuf,

    /// Override a config value, e.g. `--set retry.max_retries=5`. Repeatable.
    #[arg(long = "set", global = true, value_parser = parse_key_val)]
    overrides: Vec<(String, String)>,

    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search logs.
    Search(SearchArgs),

    /// Search logs and summarize them.
    Summarize {
        #[command(flatten)]
        search: SearchArgs,

        /// Trace function calls in timestamp order instead of general analysis.
        #[arg(long)]
        function_mode: bool,
    },

    /// Extract error-level records (default window 24h).
    Errors {
        #[command(flatten)]
        time: TimeArgs,

        /// Leave stack traces out of the report.
        #[arg(long)]
        no_stack_traces: bool,

        /// Maximum errors to return (default 10).
        #[arg(long)]
        limit: Option<usize>,

        #[arg(long)]
        index: Option<String>,

        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Field value counts and error rate (default window 1h).
    Stats {
        #[command(flatten)]
        time: TimeArgs,

        /// Field to count values of.
        #[arg(long, default_value = "level")]
        group_by: String,

        #[arg(long)]
        index: Option<String>,

        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Most recent records, newest first.
    Recent {
        /// Number of records (default 10).
        #[arg(long)]
        count: Option<usize>,

        #[arg(long)]
        level: Option<String>,

        #[arg(long)]
        index: Option<String>,

        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Find the payment session id logged for an order.
    SessionId {
        order_id: String,

        #[arg(long)]
        index: Option<String>,
    },

    /// List index patterns available in Kibana.
    Indexes,

    /// Select the active index pattern.
    UseIndex {
        pattern: String,
    },

    /// Print the effective configuration.
    Config,

    /// Print a shell completion script.
    Completions {
        shell: Shell,
    },
}

#[derive(Args, Clone, Default)]
struct TimeArgs {
    /// Relative window (`24h`, `7d`, `2w`).
    #[arg(long, conflicts_with_all = ["start", "end"])]
    time_filter: Option<String>,

    /// Absolute window start (ISO-8601).
    #[arg(long, requires = "end")]
    start: Option<String>,

    /// Absolute window end (ISO-8601).
    #[arg(long, requires = "start")]
    end: Option<String>,

    /// Deprecated: use --time-filter.
    #[arg(long, hide = true)]
    time_range: Option<String>,

    /// Deprecated: use --time-filter.
    #[arg(long, hide = true)]
    hours: Option<i64>,
}

impl From<TimeArgs> for TimeParams {
    fn from(args: TimeArgs) -> Self {
        let time_filter = match (args.time_filter, args.start, args.end) {
            (Some(relative), _, _) => Some(RawTimeFilter::Relative(relative)),
            (None, Some(start), Some(end)) => Some(RawTimeFilter::Absolute(vec![start, end])),
            _ => None,
        };
        TimeParams {
            time_filter,
            time_range: args.time_range,
            hours: args.hours,
            ..Default::default()
        }
    }
}

#[derive(Args, Clone, Default)]
struct SearchArgs {
    /// Free-text or KQL query.
    #[arg(long, short, default_value = "")]
    query: String,

    #[command(flatten)]
    time: TimeArgs,

    /// Log level to include. Repeatable.
    #[arg(long = "level")]
    levels: Vec<String>,

    /// Only return these fields. Repeatable.
    #[arg(long = "include")]
    include_fields: Vec<String>,

    /// Drop these fields. Repeatable.
    #[arg(long = "exclude")]
    exclude_fields: Vec<String>,

    #[arg(long)]
    max_results: Option<usize>,

    #[arg(long)]
    sort_by: Option<String>,

    /// `asc` or `desc`.
    #[arg(long)]
    sort_order: Option<String>,

    /// Search this index instead of the active one.
    #[arg(long)]
    index: Option<String>,

    /// Overall deadline in seconds.
    #[arg(long)]
    timeout: Option<u64>,
}

impl From<SearchArgs> for SearchRequest {
    fn from(args: SearchArgs) -> Self {
        SearchRequest {
            query: args.query,
            time: args.time.into(),
            levels: args.levels,
            include_fields: args.include_fields,
            exclude_fields: args.exclude_fields,
            max_results: args.max_results,
            sort_by: args.sort_by,
            sort_order: args.sort_order,
            index_pattern: args.index,
            timeout_secs: args.timeout,
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    config::parse_override(s).map_err(|e| e.to_string())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "kibana_harness=debug"
    } else {
        "kibana_harness=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load(cli: &Cli) -> Result<Config> {
    let base = config::load_config(&cli.config)?;
    if cli.overrides.is_empty() {
        return Ok(base);
    }
    base.apply_overrides(&cli.overrides)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "kh", &mut io::stdout());
        return Ok(());
    }

    let cfg = load(&cli)?;

    if let Commands::Config = &cli.command {
        let text = toml::to_string_pretty(&cfg.redacted()).context("Failed to render config")?;
        print!("{}", text);
        return Ok(());
    }

    let session = Session::load(&cli.session, cfg.backend.default_index.clone())?;
    let service = LogService::from_config(cfg, session)?;

    match cli.command {
        Commands::Search(args) => {
            let outcome = service.search(&args.into()).await?;
            print_json(&outcome)?;
        }
        Commands::Summarize {
            search,
            function_mode,
        } => {
            let outcome = service.summarize(&search.into(), function_mode).await?;
            print_json(&outcome)?;
        }
        Commands::Errors {
            time,
            no_stack_traces,
            limit,
            index,
            timeout,
        } => {
            let query = ErrorQuery {
                time: time.into(),
                include_stack_traces: !no_stack_traces,
                limit,
                index_pattern: index,
                timeout_secs: timeout,
            };
            print_json(&service.extract_errors(&query).await?)?;
        }
        Commands::Stats {
            time,
            group_by,
            index,
            timeout,
        } => {
            let query = StatsQuery {
                time: time.into(),
                group_by: Some(group_by),
                index_pattern: index,
                timeout_secs: timeout,
            };
            print_json(&service.analyze_logs(&query).await?)?;
        }
        Commands::Recent {
            count,
            level,
            index,
            timeout,
        } => {
            let query = RecentQuery {
                count,
                level,
                index_pattern: index,
                timeout_secs: timeout,
            };
            print_json(&service.recent_logs(&query).await?)?;
        }
        Commands::SessionId { order_id, index } => {
            let lookup = service.extract_session_id(&order_id, index.as_deref()).await?;
            print_json(&lookup)?;
        }
        Commands::Indexes => {
            let listing = service.discover_indexes().await?;
            print_json(&listing)?;
        }
        Commands::UseIndex { pattern } => {
            let invalidated = service.set_current_index(&pattern)?;
            service.session().save(&cli.session)?;
            print_json(&serde_json::json!({
                "current_index": service.session().current_index(),
                "invalidated_entries": invalidated,
            }))?;
        }
        Commands::Config | Commands::Completions { .. } => {
            bail!("command already handled")
        }
    }

    Ok(())
}

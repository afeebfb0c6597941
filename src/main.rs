use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing::info;

use cloudtail_backend::CloudLoggingClient;
use cloudtail_logs::{
    FileSink, Filter, FilterArgs, OutputSink, TailEngine, TailOptions, TerminalSink,
};

mod config;

use config::Config;

/// Cloudtail - stream Google Cloud Logging entries into the terminal
#[derive(Parser, Debug)]
#[command(name = "cloudtail")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Google Cloud project to read logs from
    #[arg(value_name = "PROJECT_ID")]
    project_id: String,

    /// Only entries with this log name
    #[arg(long = "logName", visible_alias = "log-name", value_name = "NAME")]
    log_name: Option<String>,

    /// Only entries from this monitored resource type (e.g. gce_instance)
    #[arg(long, value_name = "TYPE")]
    resource_type: Option<String>,

    /// Only entries at or above this severity (e.g. INFO, WARNING, ERROR)
    #[arg(long)]
    severity: Option<String>,

    /// Only entries newer than this relative duration (e.g. 1h, 30m, 1h15m30s; default 24h)
    #[arg(long, allow_hyphen_values = true, conflicts_with = "since_time")]
    since: Option<String>,

    /// Only entries newer than this RFC3339 timestamp (e.g. 2024-01-01T00:00:00Z)
    #[arg(long, value_name = "TIMESTAMP")]
    since_time: Option<String>,

    /// Keep streaming new entries as they arrive
    #[arg(short, long)]
    follow: bool,

    /// Stop after this many entries (-1 for no limit)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    limit: i64,

    /// Append entries to this file instead of printing them
    #[arg(short, long, value_name = "PATH")]
    output: Option<String>,

    /// Config file (default: ~/.config/cloudtail/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the compiled query filter and exit
    #[arg(long)]
    print_filter: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn filter_args(&self) -> FilterArgs {
        FilterArgs {
            log_name: self.log_name.clone().unwrap_or_default(),
            resource_type: self.resource_type.clone().unwrap_or_default(),
            severity: self.severity.clone().unwrap_or_default(),
            since: self.since.clone().unwrap_or_default(),
            since_time: self.since_time.clone().unwrap_or_default(),
        }
    }

    fn tail_options(&self) -> TailOptions {
        TailOptions {
            follow: self.follow,
            limit: self.limit,
        }
    }

    /// Output file, if one was given (an empty path means the terminal)
    fn output_path(&self) -> Option<PathBuf> {
        self.output
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Diagnostics go to stderr so they never mix with entries on stdout
    let default_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    // Validate flags before touching config or the network
    let filter = Filter::from_args(&args.filter_args())?;

    if args.print_filter {
        println!("{}", filter.compile(Utc::now()));
        return Ok(());
    }

    let config = Config::load(args.config.as_deref())?;

    let client = CloudLoggingClient::new(args.project_id.as_str())
        .with_endpoint(config.backend.endpoint.as_str())
        .with_access_token(config.backend.access_token.clone())
        .with_page_size(config.backend.page_size);
    let engine = TailEngine::new(client, config.tail_config());

    let mut sink: Box<dyn OutputSink> = match args.output_path() {
        Some(path) => Box::new(FileSink::append_to(&path)?),
        None => Box::new(TerminalSink::stdout()),
    };

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping");
                cancel.cancel();
            }
        })
    };

    let result = engine
        .run(&filter, args.tail_options(), &mut sink, &cancel)
        .await;
    interrupt.abort();

    let summary =
        result.with_context(|| format!("Failed to tail logs for project {}", args.project_id))?;
    eprintln!("{} entries emitted ({})", summary.emitted, summary.reason);
    if summary.skipped > 0 {
        eprintln!("{} malformed entries skipped", summary.skipped);
    }

    Ok(())
}

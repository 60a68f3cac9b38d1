//! CLI entry point for tunemirror
//!
//! Parses command line arguments, loads the configuration and drives one
//! engine operation.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tunemirror::{Config, Engine, Lane, ListedRecord, RunOptions, RunSummary, ABORT_EXIT_CODE};

/// tunemirror - keep a portable Opus mirror of a FLAC library
#[derive(Parser, Debug)]
#[command(name = "tunemirror")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tunemirror.toml", global = true)]
    config: PathBuf,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record the current state of the library, optionally testing FLAC files
    Scan(ScanArgs),
    /// Print the fingerprint store
    List {
        /// Only records whose source file no longer exists
        #[arg(long)]
        orphan_only: bool,
    },
    /// Re-encode FLAC files in place
    Reencode {
        #[command(flatten)]
        lane: LaneArgs,
        /// Re-encode files last encoded by an older flac
        #[arg(long)]
        reencode_on_update: bool,
    },
    /// Update the portable mirror
    Mirror {
        #[command(flatten)]
        lane: LaneArgs,
        /// Transcode again files last transcoded by an older encoder
        #[arg(long)]
        transcode_on_update: bool,
    },
    /// Rewrite library playlists to point at the mirror
    ConvertPlaylists {
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(ClapArgs, Debug)]
struct ScanArgs {
    /// Test new and changed FLAC files
    #[arg(long)]
    test: bool,
    /// Test every FLAC file
    #[arg(long)]
    test_force: bool,
    /// Test again files last tested by an older flac
    #[arg(long)]
    retest_on_update: bool,
    #[arg(long)]
    dry_run: bool,
}

#[derive(ClapArgs, Debug)]
struct LaneArgs {
    /// Process every item regardless of its recorded state
    #[arg(long)]
    force: bool,
    /// Show what would be done without doing it
    #[arg(long)]
    dry_run: bool,
    /// Reuse the stored records instead of walking the library
    #[arg(long)]
    skip_scan: bool,
}

impl LaneArgs {
    fn options(&self, lane: Lane, tool_update: bool) -> RunOptions {
        RunOptions {
            lane,
            force_all: self.force,
            tool_update,
            skip_scan: self.skip_scan,
            dry_run: self.dry_run,
        }
    }
}

/// Run options for the lane commands; None for the others.
fn run_options(command: &Command) -> Option<RunOptions> {
    match command {
        Command::Scan(scan) => {
            let testing = scan.test || scan.test_force || scan.retest_on_update;
            Some(RunOptions {
                force_all: scan.test_force,
                tool_update: scan.retest_on_update,
                dry_run: scan.dry_run,
                ..RunOptions::new(Lane::Scan { testing })
            })
        }
        Command::Reencode {
            lane,
            reencode_on_update,
        } => Some(lane.options(Lane::Reencode, *reencode_on_update)),
        Command::Mirror {
            lane,
            transcode_on_update,
        } => Some(lane.options(Lane::Mirror, *transcode_on_update)),
        Command::List { .. } | Command::ConvertPlaylists { .. } => None,
    }
}

fn init_tracing(log_level: &str) {
    let default = log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(default.into())
                .with_env_var("TUNEMIRROR_LOG")
                .from_env_lossy(),
        )
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> bool {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            true
        }
        Err(e) => {
            error!(error = %e, "Failed to render JSON");
            false
        }
    }
}

fn describe(listed: &ListedRecord) -> String {
    let record = &listed.record;
    let mut stamps = Vec::new();
    if let Some(test) = &record.test {
        stamps.push(if test.passed { "tested" } else { "test-failed" });
    }
    if record.reencode.is_some() {
        stamps.push("reencoded");
    }
    if record.transcode.is_some() {
        stamps.push("transcoded");
    }
    if record.mirror.is_some() {
        stamps.push("mirrored");
    }
    format!(
        "{}\t{:?}\t{}\t{}",
        listed.key,
        record.kind,
        record.fingerprint,
        stamps.join(",")
    )
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.has_failures() {
        ExitCode::FAILURE
    } else if summary.interrupted {
        ExitCode::from(ABORT_EXIT_CODE as u8)
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_lane(engine: Engine, options: RunOptions, json: bool) -> ExitCode {
    let listener = engine.controller().spawn_signal_listener();
    let result = engine.run(options).await;
    listener.abort();

    match result {
        Ok(summary) => {
            if json && !print_json(&summary) {
                return ExitCode::FAILURE;
            }
            exit_code(&summary)
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.log_level);

    let engine = Engine::with_external_tools(config);
    if let Some(options) = run_options(&args.command) {
        return run_lane(engine, options, args.json).await;
    }

    match args.command {
        Command::List { orphan_only } => match engine.list(orphan_only) {
            Ok(records) if args.json => {
                if print_json(&records) {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            }
            Ok(records) => {
                for listed in &records {
                    println!("{}", describe(listed));
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        },
        Command::ConvertPlaylists { dry_run } => match engine.convert_playlists(dry_run) {
            Ok(report) => {
                if args.json && !print_json(&report) {
                    return ExitCode::FAILURE;
                }
                if report.failed.is_empty() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            }
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        },
        Command::Scan(_) | Command::Reencode { .. } | Command::Mirror { .. } => ExitCode::SUCCESS,
    }
}

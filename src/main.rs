mod backoff;
mod child;
mod config;
mod reader;
mod signals;
mod supervisor;

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use config::StokerConfig;
use signals::ShutdownSignal;
use supervisor::{Supervisor, SupervisorConfig};

/// Keep a flaky long-running command alive: run it, pass its output through,
/// and restart it whenever the output goes quiet for too long.
#[derive(Parser, Debug)]
#[command(name = "stoker", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "stoker.toml")]
    config: PathBuf,

    /// Stale timeout in seconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Stop after N generations (overrides config; default: run forever)
    #[arg(long, value_name = "N")]
    max_generations: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (poll decisions, teardown steps)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long)]
    quiet: bool,

    /// Command to supervise and its arguments, after `--` (overrides config)
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "stoker=debug"
    } else if cli.quiet {
        "stoker=warn"
    } else {
        "stoker=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match StokerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("stoker: {}", e);
            std::process::exit(2);
        }
    };
    config.apply_overrides(&cli.command, cli.timeout, cli.max_generations);
    if let Err(e) = config.validate() {
        eprintln!("stoker: {}", e);
        std::process::exit(2);
    }

    if config.child.command.is_empty() {
        eprintln!(
            "stoker: no child command given (set [child] in {} or pass -- command args)",
            cli.config.display()
        );
        std::process::exit(2);
    }

    let settings = SupervisorConfig::from_config(&config);

    if cli.dry_run {
        println!("stoker v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!(
            "Child command: {} {}",
            settings.command,
            settings.args.join(" ")
        );
        println!(
            "Stale timeout: {}s, poll interval: {}s, termination grace: {}s",
            settings.stale_timeout.as_secs(),
            settings.poll_interval.as_secs(),
            settings.term_grace.as_secs()
        );
        match settings.max_generations {
            Some(n) => println!("Max generations: {}", n),
            None => println!("Max generations: unlimited"),
        }
        println!("Dry run: config validated, not running.");
        return;
    }

    let child_pid = Arc::new(AtomicU32::new(0));
    let shutdown = match ShutdownSignal::install(Arc::clone(&child_pid)) {
        Ok(shutdown) => shutdown,
        Err(e) => {
            eprintln!("stoker: failed to install signal handlers: {}", e);
            std::process::exit(1);
        }
    };

    let mut supervisor = Supervisor::new(settings, shutdown, child_pid);
    match supervisor.run().await {
        Ok(summary) => {
            if summary.interrupted {
                println!("Interrupted by user.");
            }
        }
        Err(e) => {
            eprintln!("stoker: {}", e);
            std::process::exit(1);
        }
    }
}

use clap::Parser;
use sigdump::{BlockTimer, ProfileKind, Profiler, Settings, TraceRecorder, TrackingAllocator};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator::system();

/// Small workload that dumps runtime profiles when it receives the
/// configured signals. Stops on SIGINT, SIGHUP, or SIGTERM.
#[derive(Parser, Debug)]
#[command(name = "sigdump-demo", version, about)]
pub struct Cli {
    /// Profile kinds to watch (comma separated, default: all)
    #[arg(short, long, value_delimiter = ',')]
    kinds: Vec<ProfileKind>,

    /// TOML file with defaults for the environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print resolved settings as JSON, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "sigdump=warn"
    } else if cli.verbose {
        "sigdump=debug"
    } else {
        "sigdump=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_filter(filter),
        )
        .with(TraceRecorder::global().layer())
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let kinds = if cli.kinds.is_empty() {
        ProfileKind::ALL.to_vec()
    } else {
        cli.kinds.clone()
    };

    if cli.dry_run {
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let mut profiler = Profiler::new(settings);
    if let Err(e) = profiler.run_all(&kinds) {
        eprintln!("Error: {e}");
        profiler.shutdown();
        profiler.wait().await;
        std::process::exit(1);
    }
    if let Err(e) = profiler.shutdown_on_signals() {
        eprintln!("Error: failed to install shutdown handler: {e}");
        profiler.shutdown();
        profiler.wait().await;
        std::process::exit(1);
    }

    let pid = nix::unistd::Pid::this();
    for watcher in profiler.watchers() {
        tracing::info!(
            kind = %watcher.kind(),
            path = %watcher.path().display(),
            "kill -{} {}",
            watcher.signal().number(),
            pid
        );
    }

    let workload = tokio::spawn(workload(profiler.cancellation_token()));
    profiler.wait().await;
    let _ = workload.await;
    tracing::info!("sigdump-demo stopped");
}

/// Keeps a few threads busy so the dumps have something to show.
async fn workload(scope: CancellationToken) {
    let shared = Arc::new(Mutex::new(Vec::<u64>::new()));
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    let mut round = 0u64;

    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = tick.tick() => {}
        }
        round += 1;

        let mut workers = Vec::new();
        for worker in 0..4u64 {
            let shared = Arc::clone(&shared);
            workers.push(tokio::task::spawn_blocking(move || {
                let mut acc = round ^ worker;
                for i in 0..50_000u64 {
                    acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
                }
                if let Ok(mut values) = sigdump::lock_mutex("demo.shared", &shared) {
                    values.push(acc);
                    if values.len() > 1_000 {
                        values.clear();
                    }
                }
            }));
        }

        let _timer = BlockTimer::start("demo.join_workers");
        for worker in workers {
            let _ = worker.await;
        }
        tracing::trace!(round, "workload round finished");
    }
}

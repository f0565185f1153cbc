//! The coordinator process entry point (§6): owns the task backlog, the
//! quota arbiter, the global-block FSM, and settings, all behind the
//! HTTP surface `coordinator-api` exposes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use coordinator_core::{Arbiter, InMemoryTaskStore};
use mimalloc_rust::GlobalMiMalloc;
use model::RuntimeSettings;
use task::labels::ProcessLabels;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[global_allocator]
static GLOBAL_MIMALLOC: GlobalMiMalloc = GlobalMiMalloc;

/// Fatal configuration error, e.g. an unreadable or invalid settings file.
const EXIT_CONFIG_ERROR: i32 = 1;
/// Graceful shutdown after SIGINT/SIGTERM.
const EXIT_SHUTDOWN: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "coordinator", about = "Scraping fleet coordinator: task backlog, quota arbiter, settings store")]
struct Args {
    /// Address to bind the HTTP API on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Optional YAML file holding a complete `RuntimeSettings` struct to
    /// start from. Omit this flag to start from hardcoded defaults.
    #[arg(long)]
    settings_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    let settings = match load_settings(args.settings_file.as_deref()) {
        Ok(settings) => settings,
        Err(error) => {
            error!(%error, "coordinator: fatal configuration error");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to build tokio runtime")?;

    let exit_code = runtime.block_on(run(args.bind, settings));
    std::process::exit(exit_code);
}

fn init_tracing() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default tracing subscriber failed");
}

fn load_settings(path: Option<&std::path::Path>) -> Result<RuntimeSettings> {
    let settings = match path {
        Some(path) => {
            let file = std::fs::File::open(path).wrap_err_with(|| format!("opening settings file '{}'", path.display()))?;
            let settings: RuntimeSettings =
                serde_yaml::from_reader(std::io::BufReader::new(file)).wrap_err("parsing settings file as YAML")?;
            settings
        }
        None => RuntimeSettings::default(),
    };
    settings.validate_all().map_err(|e| color_eyre::eyre::eyre!("initial settings failed validation: {e}"))?;
    Ok(settings)
}

async fn run(bind: String, settings: RuntimeSettings) -> i32 {
    let process_labels = ProcessLabels::new("coordinator");
    let mut task_manager = task::TaskManager::with_process_labels(process_labels);

    let arbiter = Arc::new(Arbiter::new(settings, Arc::new(InMemoryTaskStore::new())));
    let cancel = CancellationToken::new();

    {
        let arbiter = arbiter.clone();
        let sweep_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            arbiter.run_sweep_loop(sweep_cancel).await;
            task::TaskManager::no_task_cleaner(ProcessLabels::new("coordinator"), task::labels::TaskLabels::new("coordinator", "sweep", "coordinator"))
        });
        task_manager.register(handle, &task::labels::TaskLabels::new("coordinator", "sweep", "coordinator"));
    }

    let mut server = {
        let arbiter = arbiter.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator_api::run(&bind, arbiter, cancel).await })
    };

    let exit_code = tokio::select! {
        _ = wait_for_termination() => {
            info!("coordinator: termination signal received, shutting down");
            cancel.cancel();
            match (&mut server).await {
                Ok(Ok(())) => EXIT_SHUTDOWN,
                Ok(Err(error)) => { error!(%error, "coordinator: HTTP server reported an error during shutdown"); EXIT_SHUTDOWN }
                Err(_) => EXIT_SHUTDOWN,
            }
        }
        result = &mut server => {
            match result {
                Ok(Ok(())) => EXIT_SHUTDOWN,
                Ok(Err(error)) => { error!(%error, "coordinator: HTTP server exited unexpectedly"); EXIT_CONFIG_ERROR }
                Err(_) => EXIT_CONFIG_ERROR,
            }
        }
    };

    task_manager.join().await;
    exit_code
}

/// Waits for either SIGINT or SIGTERM (Unix) / Ctrl-C (other platforms).
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

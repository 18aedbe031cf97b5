//! rowflow command line
//!
//! `rowflow run <graph>` executes a graph locally, optionally with remote
//! parts on execution hosts. `rowflow serve` starts an execution host.

use anyhow::Context;
use clap::{Parser, Subcommand};
use rowflow::{
    cluster::{DistributedRun, ExecutionHost},
    config::EngineConfig,
    pipeline::{Graph, NodeRegistry, RunState, Scheduler},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rowflow", version, about = "Bounded-queue dataflow engine")]
struct Cli {
    /// Engine config file (TOML); the platform config dir is used otherwise
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a graph until it ends and print its final status as JSON
    Run {
        /// Graph file (.json or .toml)
        graph: PathBuf,

        /// Remote part as HOST:PORT=GRAPH, started before the local graph
        #[arg(long = "remote", value_name = "HOST:PORT=GRAPH")]
        remotes: Vec<String>,
    },
    /// Host runs for remote coordinators
    Serve {
        /// Listen address, overriding the config
        #[arg(long)]
        bind: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let _guard = init_logging(&config);

    match cli.command {
        Command::Run { graph, remotes } => {
            let state = run(&graph, &remotes, config)?;
            if state == RunState::Errored {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Serve { bind } => serve(bind, config),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(EngineConfig::load_or_default()),
    }
}

/// Console logging, plus a daily rolling file when `logging.dir` is set.
fn init_logging(config: &EngineConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rowflow=debug"));

    let (file_layer, guard) = match &config.logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rowflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

fn run(graph_path: &Path, remotes: &[String], config: EngineConfig) -> anyhow::Result<RunState> {
    let graph = Graph::load(graph_path)
        .with_context(|| format!("loading graph {}", graph_path.display()))?;
    let cluster = config.cluster.clone();
    let scheduler = Scheduler::new(NodeRegistry::with_builtins(), config);
    let run = scheduler.prepare(&graph)?;
    tracing::info!("Prepared '{}'", run.name());

    if remotes.is_empty() {
        run.start()?;
        run.wait_until_finished();
        let status = run.status();
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(status.state);
    }

    let mut distributed: DistributedRun = DistributedRun::new(run);
    for remote in remotes {
        let (addr, path) = remote
            .split_once('=')
            .with_context(|| format!("remote '{}' is not HOST:PORT=GRAPH", remote))?;
        let part = Graph::load(path).with_context(|| format!("loading graph {}", path))?;
        distributed.launch_remote(addr, &part, &cluster)?;
    }
    let status = distributed.run();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(if status.error.is_some() {
        RunState::Errored
    } else {
        status.local.state
    })
}

fn serve(bind: Option<String>, config: EngineConfig) -> anyhow::Result<()> {
    let addr = bind.unwrap_or_else(|| config.cluster.bind.clone());
    let host = Arc::new(ExecutionHost::new(NodeRegistry::with_builtins(), config));
    let server = host.serve(&addr)?;
    tracing::info!("Serving on {} (Ctrl-C to quit)", server.local_addr());
    server.join();
    Ok(())
}

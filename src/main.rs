use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowline_core::config::{AppConfig, LogConfig};
use flowline_core::error::FlowlineError;
use flowline_core::sse;
use flowline_core::spec::GraphSpec;
use flowline_core::types::Payload;
use flowline_engine::ExecutionEngine;
use flowline_gateway::GatewayServer;
use flowline_graph::GraphCompiler;
use flowline_stream::{DirSpecSource, ExecutionService};
use flowline_tools::{FunctionRegistry, ToolRegistry};

#[derive(Parser)]
#[command(name = "flowline", version, about = "Workflow graph engine with resumable event streams")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowline.toml", env = "FLOWLINE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP + SSE gateway
    Serve,
    /// Compile a graph spec and report every issue found
    Validate {
        /// Path to the graph spec (JSON)
        spec: PathBuf,
    },
    /// Run a graph locally and print its event stream
    Run {
        /// Path to the graph spec (JSON)
        spec: PathBuf,
        /// Run input as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config.log);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Validate { spec } => validate(&spec),
        Commands::Run { spec, input } => run(config, &spec, &input).await,
    }
}

/// A missing default config file falls back to defaults; an explicit missing path does not.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if path == Path::new("flowline.toml") {
        return Ok(AppConfig::default());
    }
    Err(FlowlineError::ConfigNotFound(path.display().to_string()).into())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.filter))
        .unwrap_or_else(|_| EnvFilter::new("flowline=info,warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn compiler() -> GraphCompiler {
    GraphCompiler::new(
        Arc::new(ToolRegistry::with_builtins()),
        Arc::new(FunctionRegistry::with_builtins()),
    )
}

fn read_spec(path: &Path) -> anyhow::Result<GraphSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading spec {}", path.display()))?;
    Ok(GraphSpec::from_json(&raw)?)
}

fn build_service(config: &AppConfig) -> anyhow::Result<ExecutionService> {
    let model = config
        .model
        .as_ref()
        .context("no [model] section configured; agent nodes need a model endpoint")?;
    let client = flowline_llm::create_client(model)?;
    let engine = Arc::new(ExecutionEngine::new(client, config.engine.clone()));
    let store = flowline_stream::open_event_log(&config.event_log, &config.stream)?;
    Ok(ExecutionService::new(compiler(), engine, store, config.stream.clone()))
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let mut service = build_service(&config)?;
    if let Some(dir) = config.gateway.resolved_spec_dir() {
        info!(dir = %dir.display(), "Serving graph specs from directory");
        service = service.with_spec_source(Arc::new(DirSpecSource::new(dir)));
    }
    let service = Arc::new(service);

    let cancel = CancellationToken::new();
    let janitor = service.spawn_janitor(cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down gateway...");
        shutdown.cancel();
    });

    let server = GatewayServer::new(config.gateway.clone(), service);
    server.run(cancel.clone()).await?;
    cancel.cancel();
    janitor.await.ok();
    Ok(())
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let spec = read_spec(path)?;
    match compiler().compile(&spec) {
        Ok(graph) => {
            println!(
                "ok: '{}' ({} nodes, {} edges)",
                graph.name(),
                graph.len(),
                graph.edges().len()
            );
            for warning in graph.warnings() {
                println!("warning: {}", warning);
            }
            Ok(())
        }
        Err(FlowlineError::Validation(report)) => {
            for issue in &report.issues {
                println!("error: {}", issue);
            }
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
            anyhow::bail!("{} issue(s) in {}", report.issues.len(), path.display())
        }
        Err(e) => Err(e.into()),
    }
}

async fn run(mut config: AppConfig, path: &Path, input: &str) -> anyhow::Result<()> {
    let spec = read_spec(path)?;
    let input: Payload = serde_json::from_str(input).context("--input must be a JSON object")?;

    // Local runs never outlive the process.
    config.event_log = Default::default();
    let service = build_service(&config)?;

    let id = service.submit(&spec, input).await?;
    info!(execution_id = %id, "Execution started");
    let mut events = service.subscribe(&id, None).await?;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    let mut interrupted = false;
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    stdout.write_all(sse::encode(&event).as_bytes())?;
                    stdout.flush()?;
                }
                None => break,
            },
            _ = &mut interrupt, if !interrupted => {
                interrupted = true;
                warn!(execution_id = %id, "Interrupted, cancelling run");
                service.cancel(&id).await?;
            }
        }
    }
    Ok(())
}

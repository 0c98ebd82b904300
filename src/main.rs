use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use warden_core::config::PipelineConfigCache;
use warden_core::retention::{run_retention, store_tasks};
use warden_core::{
    AgentBus, AskAgentTool, Config, ConfigWatcher, HookEvent, InboundMessage, SendMessageTool,
    TurnDispatcher, TurnEvent, TurnPipeline,
};
use warden_llm::ProviderRouter;
use warden_llm::compatible::CompatibleProvider;
use warden_store::SqliteStore;
use warden_tools::{AuditChain, ToolRegistry, register_builtin_tools};

const DEFAULT_CONFIG: &str = "warden.toml";

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Agent turn runtime with guarded tool execution")]
struct Cli {
    /// Config file path; falls back to $WARDEN_CONFIG, then ./warden.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive turn loop on stdin. Ctrl-C cancels the running turn.
    Run {
        #[arg(long, default_value = "main")]
        agent: String,
        #[arg(long, default_value = "default")]
        session: String,
    },
    /// Inspect the audit chain.
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    /// Run one retention pass over the store.
    Retention,
    /// Summarize all but the most recent messages of a session.
    Distill {
        #[arg(long, default_value = "main")]
        agent: String,
        #[arg(long, default_value = "default")]
        session: String,
    },
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    /// Recompute every checksum and report the first break.
    Verify,
}

struct Runtime {
    pipeline: Arc<TurnPipeline>,
    _bus: Arc<AgentBus>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);
    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    match cli.command {
        Command::Run { agent, session } => {
            let runtime = build_runtime(&config_path, config).await?;
            run_interactive(&runtime, &config_path, &agent, &session).await
        }
        Command::Audit {
            command: AuditCommand::Verify,
        } => verify_audit(&config).await,
        Command::Retention => {
            let store = open_store(&config).await?;
            let report = run_retention(store_tasks(&store, &config.retention)).await;
            for (name, count) in &report.counts {
                println!("{name}: {count}");
            }
            if !report.failed.is_empty() {
                bail!("retention tasks failed: {}", report.failed.join(", "));
            }
            Ok(())
        }
        Command::Distill { agent, session } => {
            let runtime = build_runtime(&config_path, config).await?;
            match runtime.pipeline.distill_session(&agent, &session).await? {
                Some(summary) => println!("{summary}"),
                None => println!("nothing to distill"),
            }
            Ok(())
        }
    }
}

fn resolve_config_path(arg: Option<PathBuf>) -> PathBuf {
    arg.or_else(|| std::env::var_os("WARDEN_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG))
}

async fn open_store(config: &Config) -> anyhow::Result<SqliteStore> {
    SqliteStore::new(&config.store.path)
        .await
        .with_context(|| format!("opening store at {}", config.store.path))
}

fn build_router(config: &Config) -> ProviderRouter {
    let mut router = ProviderRouter::new();
    for provider in &config.providers {
        let api_key = match &provider.api_key_env {
            Some(var) => std::env::var(var).unwrap_or_else(|_| {
                tracing::warn!(provider = %provider.name, var = %var, "api key variable not set");
                String::new()
            }),
            None => String::new(),
        };
        let backend = CompatibleProvider::new(provider.name.clone(), api_key, provider.base_url.clone());
        router.register(provider.name.clone(), Arc::new(backend), provider.models.clone());
        tracing::info!(provider = %provider.name, models = provider.models.len(), "registered provider");
    }
    router
}

async fn build_runtime(config_path: &Path, config: Config) -> anyhow::Result<Runtime> {
    let store = open_store(&config).await?;
    let bus = Arc::new(AgentBus::new(
        store.clone(),
        Duration::from_secs(config.agent_bus.ask_timeout_secs),
    ));

    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, &config.tools);
    registry.register(Arc::new(SendMessageTool::new(Arc::clone(&bus))));
    registry.register(Arc::new(AskAgentTool::new(Arc::clone(&bus))));
    tracing::info!(tools = ?registry.names(), "tool registry ready");

    let router = Arc::new(build_router(&config));
    let mut pipeline = TurnPipeline::new(config, store, router, Arc::new(registry));
    if config_path.exists() {
        pipeline = pipeline.with_config_source(config_path, Arc::new(PipelineConfigCache::new()));
    }
    let pipeline = Arc::new(pipeline);

    let dispatcher: Arc<dyn TurnDispatcher> = pipeline.clone();
    bus.attach(Arc::downgrade(&dispatcher));

    Ok(Runtime {
        pipeline,
        _bus: bus,
    })
}

/// Reload the configuration on every debounced change until the watcher stops.
fn spawn_config_reloader(pipeline: Arc<TurnPipeline>, path: &Path) -> Option<ConfigWatcher> {
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let (tx, mut rx) = mpsc::channel(4);
    let watcher = match ConfigWatcher::start(&path, tx) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "config watcher unavailable");
            return None;
        }
    };
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            match Config::load(&path) {
                Ok(config) => pipeline.reload(config).await,
                Err(e) => tracing::warn!(error = %e, "config reload failed, keeping current"),
            }
        }
    });
    Some(watcher)
}

async fn run_interactive(
    runtime: &Runtime,
    config_path: &Path,
    agent: &str,
    session: &str,
) -> anyhow::Result<()> {
    let pipeline = &runtime.pipeline;
    if pipeline.config().agent(agent).is_none() {
        bail!("agent `{agent}` is not configured");
    }
    let _watcher = spawn_config_reloader(Arc::clone(pipeline), config_path);

    let store = pipeline.store().clone();
    let retention = pipeline.config().retention.clone();
    tokio::spawn(async move {
        run_retention(store_tasks(&store, &retention)).await;
    });

    pipeline.hooks().dispatch(&HookEvent::Start).await;
    eprintln!("warden: talking to `{agent}` in session `{session}` (Ctrl-D to quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let cancel = CancellationToken::new();
        let mut events =
            pipeline.run_streaming(InboundMessage::new(agent, session, text), cancel.clone());
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => render(&event),
                    None => break,
                },
                _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                    eprintln!("[cancelling]");
                    cancel.cancel();
                }
            }
        }
    }

    pipeline.hooks().dispatch(&HookEvent::Shutdown).await;
    Ok(())
}

fn render(event: &TurnEvent) {
    match event {
        TurnEvent::Start { .. } => {}
        TurnEvent::TextDelta(text) => println!("{text}"),
        TurnEvent::ToolCall { name, is_error, .. } => {
            eprintln!("[{name} {}]", if *is_error { "failed" } else { "ok" });
        }
        TurnEvent::TurnComplete(outcome) => {
            if outcome.partial {
                eprintln!("[turn stopped early]");
            }
            if outcome.loop_cap_reached {
                eprintln!("[tool loop cap reached]");
            }
            tracing::debug!(
                tool_calls = outcome.tool_calls,
                cost_usd = outcome.cost_usd,
                "turn complete"
            );
        }
        TurnEvent::Failed(message) => eprintln!("error: {message}"),
    }
}

async fn verify_audit(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let chain = AuditChain::new(Arc::new(store));
    let report = chain.verify().await.context("reading audit log")?;
    println!("entries: {}", report.total);
    println!("checked: {}", report.checked);
    if report.valid {
        println!("chain intact");
        return Ok(());
    }
    if let Some(id) = report.tamper_index {
        println!("first bad entry: {id}");
    }
    bail!(
        "audit chain broken: {}",
        report.reason.as_deref().unwrap_or("unknown reason")
    )
}

//! `run` subcommand: submit one workflow definition against a live bus
//! and drive the engine loop until that execution finalizes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use workflow_core::artifact::{ArtifactService, FsArtifactService};
use workflow_core::bus::MqttBus;
use workflow_core::context::{A2aContext, InboundHandle};
use workflow_core::engine::Engine;
use workflow_core::progress::ProgressSink;
use workflow_core::registry::{AgentCard, AgentRegistry};

use crate::validate::load_definition;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the workflow definition JSON file.
    workflow: PathBuf,

    /// Path to a JSON file with the workflow's input payload. Defaults to `{}`.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Path to the TOML config file. Falls back to built-in defaults if absent.
    #[arg(long, default_value = "workflow.toml")]
    config: PathBuf,

    /// Path to a JSON file holding an array of agent discovery cards to
    /// pre-register before dispatch.
    #[arg(long)]
    agents: Option<PathBuf>,

    /// Append progress events to this JSONL file as the workflow runs.
    #[arg(long)]
    progress_log: Option<PathBuf>,

    /// User id attributed to this execution.
    #[arg(long, default_value = "cli-user")]
    user_id: String,

    /// Session id attributed to this execution.
    #[arg(long, default_value = "cli-session")]
    session_id: String,

    /// How often to check whether the execution has finalized.
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,
}

pub async fn run_command(args: RunArgs) -> Result<()> {
    let config = workflow_core::config::load_config(&args.config)?;
    let definition = load_definition(&args.workflow)?;

    let input = match &args.input {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read input at {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("failed to parse input at {}", path.display()))?
        }
        None => serde_json::json!({}),
    };

    let registry = Arc::new(AgentRegistry::new());
    if let Some(path) = &args.agents {
        ingest_agent_cards(&registry, path)?;
    }

    let artifacts: Arc<dyn ArtifactService> = Arc::new(FsArtifactService::new(config.artifact.base_dir.clone()));

    let bus = Arc::new(
        MqttBus::connect(&config.bus.broker_url, &config.bus.client_id, config.bus.keep_alive_seconds)
            .context("failed to connect to the bus broker")?,
    );

    let progress = match &args.progress_log {
        Some(path) => Some(Arc::new(ProgressSink::create(path).context("failed to open progress log")?)),
        None => None,
    };

    let engine = Engine::new(bus, artifacts, registry, config.engine.clone(), progress);

    let a2a_context = A2aContext {
        logical_task_id: uuid::Uuid::new_v4().to_string(),
        session_id: args.session_id.clone(),
        user_id: args.user_id.clone(),
        client_id: None,
        jsonrpc_request_id: serde_json::Value::Null,
        reply_to_topic: None,
        original_inbound_handle: InboundHandle("cli".to_string()),
    };

    let workflow_name = args
        .workflow
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("workflow")
        .to_string();

    let execution_id = engine
        .submit(workflow_name, definition, input, a2a_context)
        .await
        .context("failed to submit workflow")?;
    println!("submitted execution {execution_id}");

    let engine_loop = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    let mut interval = tokio::time::interval(Duration::from_millis(args.poll_interval_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !engine.is_active(&execution_id).await {
                    println!("execution {execution_id} finished");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted; execution {execution_id} may still be in flight");
                break;
            }
        }
    }

    engine_loop.abort();
    Ok(())
}

fn ingest_agent_cards(registry: &AgentRegistry, path: &PathBuf) -> Result<()> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read agent cards at {}", path.display()))?;
    let cards: Vec<AgentCard> = serde_json::from_str(&data)
        .with_context(|| format!("failed to parse agent cards at {}", path.display()))?;
    for card in cards {
        registry.ingest(card);
    }
    Ok(())
}

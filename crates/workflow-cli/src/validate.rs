//! `validate` subcommand: load a workflow definition and run DAG
//! validation only, without touching a bus or artifact store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use workflow_core::dag::Dag;
use workflow_core::model::WorkflowDefinition;

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the workflow definition JSON file.
    workflow: PathBuf,

    /// Print the resolved dependency graph as JSON instead of a summary.
    #[arg(long)]
    json: bool,
}

pub fn validate_command(args: ValidateArgs) -> Result<()> {
    let definition = load_definition(&args.workflow)?;
    let dag = Dag::build(&definition).context("workflow failed DAG validation")?;

    if args.json {
        let output = serde_json::json!({
            "valid": true,
            "node_count": definition.nodes.len(),
            "dependencies": dag.dependencies,
            "inner_nodes": dag.inner_nodes,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("workflow '{}' is valid", args.workflow.display());
        println!("  nodes:       {}", definition.nodes.len());
        println!("  inner nodes: {}", dag.inner_nodes.len());
    }

    Ok(())
}

/// Shared by `validate` and `run`: read and parse a workflow definition
/// from a JSON file.
pub fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow definition at {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("failed to parse workflow definition at {}", path.display()))
}

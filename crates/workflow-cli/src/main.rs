use anyhow::Result;
use clap::{Parser, Subcommand};

mod doctor;
mod run;
mod validate;

#[derive(Parser)]
#[command(name = "workflow-executor", version, about = "Prescriptive Workflow executor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a workflow definition to the bus and drive it to completion.
    Run(run::RunArgs),
    /// Validate a workflow definition's DAG without dispatching anything.
    Validate(validate::ValidateArgs),
    /// Check configuration and broker connectivity.
    Doctor(doctor::DoctorArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    workflow_core::init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run::run_command(args).await,
        Command::Validate(args) => validate::validate_command(args),
        Command::Doctor(args) => doctor::doctor_command(args).await,
    }
}

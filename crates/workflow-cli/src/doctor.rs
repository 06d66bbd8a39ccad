//! `doctor` subcommand: sanity-check configuration and broker connectivity
//! before attempting a real run.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

#[derive(Args)]
pub struct DoctorArgs {
    /// Path to the TOML config file. Falls back to built-in defaults if absent.
    #[arg(long, default_value = "workflow.toml")]
    config: PathBuf,

    /// Print the report as JSON instead of a human-readable summary.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    config_path: String,
    namespace: String,
    broker_url: String,
    broker_reachable: bool,
    broker_error: Option<String>,
    artifact_base_dir: String,
    artifact_dir_writable: bool,
}

impl DoctorReport {
    fn healthy(&self) -> bool {
        self.broker_reachable && self.artifact_dir_writable
    }
}

pub async fn doctor_command(args: DoctorArgs) -> Result<()> {
    let config = workflow_core::config::load_config(&args.config)?;

    let (broker_reachable, broker_error) = match check_broker_reachable(config.bus.broker_url.clone()).await {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e)),
    };

    let artifact_dir_writable = check_artifact_dir_writable(&config.artifact.base_dir);

    let report = DoctorReport {
        config_path: args.config.display().to_string(),
        namespace: config.engine.namespace.clone(),
        broker_url: config.bus.broker_url.clone(),
        broker_reachable,
        broker_error,
        artifact_base_dir: config.artifact.base_dir.clone(),
        artifact_dir_writable,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Workflow Executor Doctor");
        println!("========================");
        println!("  Config:       {}", report.config_path);
        println!("  Namespace:    {}", report.namespace);
        println!(
            "  Broker:       {} ({})",
            report.broker_url,
            if report.broker_reachable { "reachable" } else { "unreachable" }
        );
        if let Some(err) = &report.broker_error {
            println!("    error: {err}");
        }
        println!(
            "  Artifact dir: {} ({})",
            report.artifact_base_dir,
            if report.artifact_dir_writable { "writable" } else { "not writable" }
        );
    }

    if !report.healthy() {
        anyhow::bail!("doctor checks failed");
    }
    Ok(())
}

/// Plain TCP reachability to the broker's `host:port`, not a full MQTT
/// handshake — enough to distinguish "broker down" from "config wrong".
async fn check_broker_reachable(broker_url: String) -> Result<(), String> {
    tokio::task::spawn_blocking(move || {
        let addr = broker_url
            .to_socket_addrs()
            .map_err(|e| e.to_string())?
            .next()
            .ok_or_else(|| format!("no addresses resolved for '{broker_url}'"))?;
        std::net::TcpStream::connect_timeout(&addr, Duration::from_secs(3)).map_err(|e| e.to_string())?;
        Ok(())
    })
    .await
    .unwrap_or_else(|e| Err(e.to_string()))
}

fn check_artifact_dir_writable(base_dir: &str) -> bool {
    if std::fs::create_dir_all(base_dir).is_err() {
        return false;
    }
    let probe = std::path::Path::new(base_dir).join(".doctor-probe");
    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

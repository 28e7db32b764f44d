// Deployer binary entry point
// Detects available updates, confirms with the operator and runs one workflow at a time

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::config::Settings;
use common::errors::WorkflowError;
use common::models::WorkflowReport;
use common::orchestrator::Orchestrator;
use common::telemetry::init_logging;
use common::transport::TerminalPrompt;
use common::workflow::WorkflowKind;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "deployer", version, about = "Push updates to the smart cabinet fleet")]
struct Cli {
    /// Directory holding default.toml / local.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Write the JSON run report of each workflow into this directory
    #[arg(long)]
    report_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List workflows whose local artifacts are present
    Detect,
    /// Run one workflow
    Run {
        /// backend-service, smart-cabinet, access-door, database-reinstall or door-config
        workflow: WorkflowKind,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from_path(&cli.config_dir)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    init_logging(&settings.observability.log_level, settings.observability.json)?;
    info!(config_dir = %cli.config_dir.display(), "Configuration loaded successfully");

    let orchestrator = Orchestrator::new(settings, Arc::new(TerminalPrompt));

    let outcome = tokio::select! {
        result = execute(&cli, &orchestrator) => result,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, closing sessions");
            orchestrator.shutdown().await;
            // A pending terminal prompt would keep the runtime alive
            std::process::exit(130);
        }
    };

    orchestrator.shutdown().await;
    if let Err(e) = &outcome {
        error!(error = %format!("{:#}", e), "Deployer finished with an error");
    }
    outcome
}

async fn execute(cli: &Cli, orchestrator: &Orchestrator) -> Result<()> {
    match &cli.command {
        Some(Command::Detect) => {
            let available = orchestrator.catalog().detect_available();
            if available.is_empty() {
                println!("No update artifacts detected");
            }
            for kind in available {
                println!("{:<20} {}", kind.to_string(), kind.description());
            }
            Ok(())
        }
        Some(Command::Run { workflow, yes }) => {
            if !*yes && !confirm(*workflow).await? {
                info!("Cancelled by operator");
                return Ok(());
            }
            run_workflow(orchestrator, *workflow, cli.report_dir.as_deref()).await
        }
        None => menu(orchestrator, cli.report_dir.as_deref()).await,
    }
}

/// Interactive loop: list detected workflows, run the chosen one, repeat
async fn menu(orchestrator: &Orchestrator, report_dir: Option<&Path>) -> Result<()> {
    loop {
        let available = orchestrator.catalog().detect_available();
        if available.is_empty() {
            println!("No update artifacts detected");
            return Ok(());
        }

        println!("\nAvailable updates:");
        for (index, kind) in available.iter().enumerate() {
            println!("  {}. {}", index + 1, kind.description());
        }
        let choice = read_line("Select a number (q to quit): ").await?;
        let choice = choice.trim();
        if choice.is_empty() || choice.eq_ignore_ascii_case("q") {
            return Ok(());
        }

        let Some(kind) = choice
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| available.get(n).copied())
        else {
            warn!(choice = %choice, "Invalid selection");
            continue;
        };

        if !confirm(kind).await? {
            continue;
        }
        // A failed workflow is reported and the menu is shown again
        if let Err(e) = run_workflow(orchestrator, kind, report_dir).await {
            error!(error = %format!("{:#}", e), "Update failed");
        }
    }
}

async fn run_workflow(
    orchestrator: &Orchestrator,
    kind: WorkflowKind,
    report_dir: Option<&Path>,
) -> Result<()> {
    info!(workflow = %kind, "Starting update");
    match orchestrator.run(kind).await {
        Ok(report) => {
            info!(
                outcome = "success",
                workflow = %kind,
                run_id = %report.run_id,
                suppressed = report.suppressed().count(),
                "Update finished successfully"
            );
            write_report(report_dir, &report)?;
            Ok(())
        }
        Err(e) => {
            if let Some(report) = e.report() {
                write_report(report_dir, report)?;
            }
            if let WorkflowError::Aborted { step_index, .. } = &e {
                error!(workflow = %kind, step = step_index + 1, "Update aborted");
            }
            Err(e).with_context(|| format!("workflow '{}' failed", kind))
        }
    }
}

fn write_report(report_dir: Option<&Path>, report: &WorkflowReport) -> Result<()> {
    let Some(dir) = report_dir else {
        return Ok(());
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory {}", dir.display()))?;
    let path = dir.join(format!("{}-{}.json", report.workflow, report.run_id));
    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write report {}", path.display()))?;
    info!(path = %path.display(), "Run report written");
    Ok(())
}

async fn confirm(kind: WorkflowKind) -> Result<bool> {
    let answer = read_line(&format!("{}? [y/N]: ", kind.description())).await?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

async fn read_line(prompt: &str) -> Result<String> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || -> Result<String> {
        print!("{}", prompt);
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await
    .context("Prompt task failed")?
}

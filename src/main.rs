use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

use flexflow::{init_telemetry, FlexflowConfig, Payload, WorkflowEngine, WorkflowMode};

#[derive(Parser)]
#[command(name = "flexflow")]
#[command(about = "Adaptive multi-step workflows with resumable state")]
#[command(long_about = "Flexflow drives multi-step workflows (Quick, Guided or Advanced) through \
                       dependency-checked steps, persists them between sessions and learns from \
                       each user's history to suggest modes and shortcuts.")]
struct Cli {
    /// Configuration file to use instead of flexflow.toml / .flexflow-rc
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the persistence directory
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the step catalog
    Steps {
        /// Only steps enabled in this mode
        #[arg(long)]
        mode: Option<WorkflowMode>,
    },
    /// Start a new workflow and print its id
    Create { user: String, mode: WorkflowMode },
    /// Print the full workflow state
    Show { workflow_id: String },
    /// Complete a step, merging an optional JSON object into the form data
    Advance {
        workflow_id: String,
        step: String,
        #[arg(long, help = "JSON object merged into the step and form data")]
        data: Option<String>,
    },
    /// Move the current step to any step whose dependencies are complete
    Jump { workflow_id: String, step: String },
    /// Skip an optional step
    Skip { workflow_id: String, step: String },
    /// Progress and remaining-time estimate
    Progress { workflow_id: String },
    /// Steps that could run next
    Available { workflow_id: String },
    /// The user's workflows, newest first
    List { user: String },
    /// Id of the user's most recently touched workflow
    Resume { user: String },
    /// Delete a workflow
    Delete { workflow_id: String },
    /// Recommended mode and shortcut hints
    Suggest { user: String },
    /// Dashboard widgets
    Dashboard { user: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    FlexflowConfig::load_env_file()?;
    let mut config = match &cli.config {
        Some(path) => FlexflowConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => FlexflowConfig::load().context("Failed to load configuration")?,
    };
    if let Some(dir) = cli.state_dir {
        config.persistence.directory = dir;
    }

    init_telemetry(&config.observability)?;

    tokio::runtime::Runtime::new()?.block_on(async { run(cli.command, config).await })
}

async fn run(command: Commands, config: FlexflowConfig) -> Result<()> {
    let engine = WorkflowEngine::from_config(&config)?;

    match command {
        Commands::Steps { mode } => {
            let steps: Vec<_> = match mode {
                Some(mode) => engine.registry().steps_for(mode).collect(),
                None => engine.registry().steps().collect(),
            };
            print_json(&steps)
        }
        Commands::Create { user, mode } => {
            let workflow_id = engine.create_workflow(&user, mode).await;
            engine.try_save_workflow(&workflow_id).await?;
            print_json(&serde_json::json!({ "workflow_id": workflow_id }))
        }
        Commands::Show { workflow_id } => match engine.get_workflow(&workflow_id).await {
            Some(state) => print_json(&state),
            None => bail!("Workflow not found: {}", workflow_id),
        },
        Commands::Advance {
            workflow_id,
            step,
            data,
        } => {
            let payload: Payload = match data {
                Some(raw) => serde_json::from_str(&raw).context("--data must be a JSON object")?,
                None => Payload::new(),
            };
            let outcome = engine.try_advance_step(&workflow_id, &step, payload).await?;
            engine.try_save_workflow(&workflow_id).await?;
            print_json(&outcome)
        }
        Commands::Jump { workflow_id, step } => {
            let outcome = engine.try_jump_to_step(&workflow_id, &step).await?;
            engine.try_save_workflow(&workflow_id).await?;
            print_json(&outcome)
        }
        Commands::Skip { workflow_id, step } => {
            let outcome = engine.try_skip_step(&workflow_id, &step).await?;
            engine.try_save_workflow(&workflow_id).await?;
            print_json(&outcome)
        }
        Commands::Progress { workflow_id } => match engine.get_progress(&workflow_id).await {
            Some(progress) => print_json(&progress),
            None => bail!("Workflow not found: {}", workflow_id),
        },
        Commands::Available { workflow_id } => match engine.available_steps(&workflow_id).await {
            Some(steps) => print_json(&steps),
            None => bail!("Workflow not found: {}", workflow_id),
        },
        Commands::List { user } => print_json(&engine.list_user_workflows(&user).await),
        Commands::Resume { user } => match engine.resume_latest_workflow(&user).await {
            Some(workflow_id) => print_json(&serde_json::json!({ "workflow_id": workflow_id })),
            None => bail!("No workflows found for user {}", user),
        },
        Commands::Delete { workflow_id } => {
            if !engine.try_delete_workflow(&workflow_id).await? {
                bail!("Workflow not found: {}", workflow_id);
            }
            print_json(&serde_json::json!({ "deleted": workflow_id }))
        }
        Commands::Suggest { user } => print_json(&engine.get_suggestions(&user).await),
        Commands::Dashboard { user } => print_json(&engine.get_dashboard_widgets(&user).await),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

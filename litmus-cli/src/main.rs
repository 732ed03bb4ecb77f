//! Litmus worker - batch entry point for test runs and missions

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use litmus_core::config::LitmusConfig;
use litmus_core::model::EvaluationType;
use litmus_core::orchestrator::{Orchestrator, RunRequest};
use litmus_core::store::Stores;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "litmus-worker")]
#[command(about = "Executes Litmus test runs and missions", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to litmus.toml and LITMUS_* variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a run to completion
    Run {
        /// Run identifier
        #[arg(long, env = "RUN_ID")]
        run_id: String,

        /// Template to execute
        #[arg(long, env = "TEMPLATE_ID")]
        template_id: String,

        /// Evaluation types replacing the template's (comma-separated)
        #[arg(long, env = "EVALUATION_TYPES", value_delimiter = ',')]
        evaluation_types: Option<Vec<EvaluationType>>,

        /// JSON file with a pre-request payload override
        #[arg(long)]
        pre_request: Option<PathBuf>,

        /// JSON file with a post-request payload override
        #[arg(long)]
        post_request: Option<PathBuf>,

        /// Value for `{auth_token}` placeholders
        #[arg(long, env = "LITMUS_AUTH_TOKEN", hide_env_values = true)]
        auth_token: Option<String>,
    },
    /// Show a run and its results
    Status {
        /// Run identifier
        run_id: String,

        /// Include every test case result
        #[arg(long)]
        results: bool,
    },
    /// Clear a run's results and reset it to not started
    Restart {
        /// Run identifier
        run_id: String,
    },
    /// Delete a run and its results
    Delete {
        /// Run identifier
        run_id: String,
    },
    /// Version information
    Version,
}

fn load_config(path: Option<&Path>) -> Result<LitmusConfig> {
    let config = match path {
        Some(path) => LitmusConfig::from_file(path)?,
        None => LitmusConfig::load()?,
    };
    Ok(config)
}

fn init_tracing(config: &LitmusConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn read_payload(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read payload file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("litmus-worker {}", env!("CARGO_PKG_VERSION"));
        println!("litmus-core {}", litmus_core::VERSION);
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Run {
            run_id,
            template_id,
            evaluation_types,
            pre_request,
            post_request,
            auth_token,
        } => {
            config.validate_for_run()?;
            let request = RunRequest {
                run_id,
                template_id,
                pre_request: pre_request.as_deref().map(read_payload).transpose()?,
                post_request: post_request.as_deref().map(read_payload).transpose()?,
                evaluation_types,
                auth_token,
            };

            let orchestrator = Orchestrator::from_config(&config)
                .await
                .context("Failed to initialize the worker")?;
            let summary = orchestrator.execute(request).await?;
            print_json(&summary)?;
        }
        Commands::Status { run_id, results } => {
            config.validate_for_admin()?;
            let stores = Stores::from_config(&config).await?;
            let run = stores
                .runs
                .get_run(&run_id)
                .await?
                .with_context(|| format!("Run '{}' not found", run_id))?;

            if results {
                let results = stores.runs.list_results(&run_id).await?;
                print_json(&serde_json::json!({ "run": run, "results": results }))?;
            } else {
                print_json(&run)?;
            }
        }
        Commands::Restart { run_id } => {
            config.validate_for_admin()?;
            let stores = Stores::from_config(&config).await?;
            let run = stores.runs.restart_run(&run_id).await?;
            print_json(&run)?;
        }
        Commands::Delete { run_id } => {
            config.validate_for_admin()?;
            let stores = Stores::from_config(&config).await?;
            stores.runs.delete_run(&run_id).await?;
            tracing::info!(run_id = %run_id, "Run deleted");
        }
        Commands::Version => {}
    }

    Ok(())
}

//! # awe-cli
//!
//! Command line surface for the awe workflow engine:
//!
//! - `awe run <file>` - execute a workflow document to quiescence
//! - `awe serve` - host the REST facade
//! - `awe task ...` - inspect and transition human tasks on a running
//!   server
//!
//! Exit code 0 on a completed run, 1 on a failed run or load error.

mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use awe_core::document;
use awe_core::engine::{Engine, EngineOptions, RunStatus};
use awe_llm::{GeminiClient, RemoteLlmConfig};
use awe_tasks::InMemoryTaskStore;

#[derive(Parser)]
#[command(name = "awe")]
#[command(about = "Agentic workflow engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow document to quiescence
    Run {
        /// Path to a JSON or YAML workflow document
        file: PathBuf,

        /// Verbose engine logging
        #[arg(short, long)]
        verbose: bool,

        /// Model credential; falls back to GEMINI_API_KEY
        #[arg(long, env = "GEMINI_API_KEY")]
        key: Option<String>,

        /// Run inputs as a JSON object
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Serve the REST API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,

        /// Model credential; falls back to GEMINI_API_KEY
        #[arg(long, env = "GEMINI_API_KEY")]
        key: Option<String>,
    },

    /// Inspect and transition human tasks on a running server
    Task {
        #[command(subcommand)]
        command: TaskCommands,

        /// Base URL of a running `awe serve`
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List tasks, optionally for one role's pending queue
    List {
        #[arg(long)]
        role: Option<String>,
    },
    /// Show one task
    Show { id: String },
    /// Assign a task to a user
    Assign {
        id: String,
        user: String,
        #[arg(long)]
        assigner: Option<String>,
    },
    /// Complete an in-progress task with JSON outputs
    Complete {
        id: String,
        #[arg(short, long, default_value = "{}")]
        outputs: String,
    },
    /// Reject an in-progress task
    Reject { id: String, reason: String },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            verbose,
            key,
            input,
        } => {
            init_tracing(verbose);
            run_workflow(&file, key, input).await
        }
        Commands::Serve { port, key } => {
            init_tracing(false);
            match server::serve(port, key).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("server error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Task { command, server } => match task_command(command, &server).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run_workflow(file: &PathBuf, key: Option<String>, input: Option<String>) -> ExitCode {
    let workflow = match document::load_path(file) {
        Ok(workflow) => Arc::new(workflow),
        Err(e) => {
            eprintln!("failed to load {}: {e}", file.display());
            return ExitCode::FAILURE;
        }
    };
    let inputs = match input.as_deref() {
        None => serde_json::json!({}),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("--input is not valid JSON: {e}");
                return ExitCode::FAILURE;
            }
        },
    };

    let mut options = EngineOptions::new(Arc::new(InMemoryTaskStore::new()));
    if let Some(key) = key {
        options = options
            .with_model(Box::new(GeminiClient::new(RemoteLlmConfig::with_key(
                key.as_str(),
            ))))
            .with_credential(key);
    }

    let mut engine = match Engine::new(workflow, options) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to build engine: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = engine.start(inputs) {
        eprintln!("failed to start run: {e}");
        return ExitCode::FAILURE;
    }

    match engine.run_to_quiescence().await {
        Ok(RunStatus::Completed) => {
            println!("status: completed");
            for token in engine.tokens() {
                println!(
                    "token {} -> {}",
                    token.id,
                    serde_json::to_string(&token.data).unwrap_or_default()
                );
            }
            ExitCode::SUCCESS
        }
        Ok(RunStatus::Waiting) => {
            println!("status: waiting");
            println!("the run is suspended on human tasks; use `awe serve` to host interactive runs");
            ExitCode::from(2)
        }
        Ok(status) => {
            println!("status: {status}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("run error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn task_command(command: TaskCommands, server: &str) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let response = match command {
        TaskCommands::List { role: Some(role) } => {
            client
                .get(format!("{server}/api/v1/tasks/pending/{role}"))
                .send()
                .await?
        }
        TaskCommands::List { role: None } => {
            client.get(format!("{server}/api/v1/tasks")).send().await?
        }
        TaskCommands::Show { id } => {
            client
                .get(format!("{server}/api/v1/tasks/{id}"))
                .send()
                .await?
        }
        TaskCommands::Assign { id, user, assigner } => {
            client
                .post(format!("{server}/api/v1/tasks/{id}/assign"))
                .json(&serde_json::json!({
                    "assignee_id": user,
                    "assigner_id": assigner,
                }))
                .send()
                .await?
        }
        TaskCommands::Complete { id, outputs } => {
            let outputs: serde_json::Value = serde_json::from_str(&outputs)?;
            client
                .post(format!("{server}/api/v1/tasks/{id}/complete"))
                .json(&serde_json::json!({ "outputs": outputs }))
                .send()
                .await?
        }
        TaskCommands::Reject { id, reason } => {
            client
                .post(format!("{server}/api/v1/tasks/{id}/reject"))
                .json(&serde_json::json!({ "reason": reason }))
                .send()
                .await?
        }
    };

    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    println!("{}", serde_json::to_string_pretty(&body)?);
    if !status.is_success() {
        anyhow::bail!("server returned {status}");
    }
    Ok(())
}

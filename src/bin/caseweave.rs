//! Caseweave CLI
//!
//! Command-line front end over the engine facade: register specifications,
//! launch and cancel cases, inspect status and live work items.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use caseweave::engine::EngineOverride;
use caseweave::spec::types::PreferredEngine;
use caseweave::{
    CaseId, Engine, EngineConfig, EventSink, SledStore, SpecificationId, WorkflowError,
};

#[derive(Parser)]
#[command(name = "caseweave")]
#[command(about = "Workflow engine with YAWL-style join/split semantics")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State store path
    #[arg(long, default_value = "./caseweave_db")]
    state_store: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a workflow specification (JSON or YAML)
    Register {
        /// Specification file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Launch a case
    Launch {
        /// Specification id as id:version
        #[arg(long)]
        spec: String,
        /// Engine override (stateful or stateless); requires engine-admin
        #[arg(long = "override")]
        engine_override: Option<String>,
        /// Initial case data (JSON object)
        #[arg(long)]
        data: Option<String>,
    },

    /// Show case status
    Status {
        /// Case id
        case_id: String,
    },

    /// Cancel a case
    Cancel {
        /// Case id
        case_id: String,
    },

    /// List live work items
    Items {
        /// Restrict to one case
        #[arg(long)]
        case: Option<String>,
    },

    /// List known cases
    ListCases {
        /// Restrict to one specification (id:version)
        #[arg(long)]
        spec: Option<String>,
    },
}

fn bad_args(message: &str) -> ExitCode {
    eprintln!("error: {message}");
    ExitCode::from(2)
}

fn report(err: WorkflowError) -> ExitCode {
    eprintln!("error: {err}");
    ExitCode::from(err.exit_code() as u8)
}

fn parse_spec_id(s: &str) -> Option<SpecificationId> {
    SpecificationId::parse_str(s)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(err) => return report(err),
    };
    let store = match SledStore::open(&cli.state_store) {
        Ok(store) => Arc::new(store),
        Err(err) => return report(err),
    };
    let engine = Engine::new(config, store, EventSink::disabled());
    let now = chrono::Utc::now();

    if let Err(err) = engine.recover(now).await {
        return report(err);
    }

    match cli.command {
        Commands::Register { file } => {
            let bytes = match std::fs::read(&file) {
                Ok(bytes) => bytes,
                Err(err) => return bad_args(&format!("cannot read {}: {err}", file.display())),
            };
            match engine.register_spec(&bytes) {
                Ok(spec) => {
                    println!("registered {}", spec.id);
                    ExitCode::SUCCESS
                }
                Err(err) => report(err),
            }
        }

        Commands::Launch {
            spec,
            engine_override,
            data,
        } => {
            let Some(spec_id) = parse_spec_id(&spec) else {
                return bad_args("spec must be id:version");
            };
            let data = match data {
                Some(text) => match serde_json::from_str(&text) {
                    Ok(value) => value,
                    Err(err) => return bad_args(&format!("invalid --data JSON: {err}")),
                },
                None => serde_json::json!({}),
            };
            let requested = match engine_override.as_deref() {
                None => None,
                Some("stateful") => Some(PreferredEngine::Stateful),
                Some("stateless") => Some(PreferredEngine::Stateless),
                Some(other) => {
                    return bad_args(&format!("override must be stateful or stateless, got {other}"))
                }
            }
            .map(|engine| EngineOverride {
                engine,
                // The CLI runs with operator credentials.
                role: "engine-admin".to_string(),
            });

            match engine.launch_case(&spec_id, data, requested, now).await {
                Ok(receipt) => {
                    println!(
                        "{} engine={:?} reason={}",
                        receipt.case_id, receipt.engine_used, receipt.selection_reason
                    );
                    ExitCode::SUCCESS
                }
                Err(err) => report(err),
            }
        }

        Commands::Status { case_id } => {
            let case_id = match CaseId::parse_str(&case_id) {
                Ok(id) => id,
                Err(_) => return bad_args("case id must be a UUID"),
            };
            match engine.get_case(case_id).await {
                Ok(view) => {
                    match serde_json::to_string_pretty(&view) {
                        Ok(json) => println!("{json}"),
                        Err(err) => return report(WorkflowError::Parse(err.to_string())),
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => report(err),
            }
        }

        Commands::Cancel { case_id } => {
            let case_id = match CaseId::parse_str(&case_id) {
                Ok(id) => id,
                Err(_) => return bad_args("case id must be a UUID"),
            };
            let event_id = format!("cli-cancel-{case_id}");
            match engine.cancel_case(case_id, &event_id, now).await {
                Ok(lifecycle) => {
                    println!("{case_id} {lifecycle}");
                    ExitCode::SUCCESS
                }
                Err(err) => report(err),
            }
        }

        Commands::Items { case } => {
            let case_id = match case {
                Some(text) => match CaseId::parse_str(&text) {
                    Ok(id) => Some(id),
                    Err(_) => return bad_args("case id must be a UUID"),
                },
                None => None,
            };
            match engine.list_live_work_items(case_id).await {
                Ok(items) => {
                    for item in items {
                        println!(
                            "{} case={} task={} state={} assignee={}",
                            item.id,
                            item.case_id,
                            item.task_id,
                            item.state,
                            item.assignee.as_deref().unwrap_or("-")
                        );
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => report(err),
            }
        }

        Commands::ListCases { spec } => {
            let spec_id = match spec.as_deref() {
                Some(text) => match parse_spec_id(text) {
                    Some(id) => Some(id),
                    None => return bad_args("spec must be id:version"),
                },
                None => None,
            };
            match engine.list_cases(spec_id.as_ref()).await {
                Ok(cases) => {
                    for (case_id, lifecycle, spec_id) in cases {
                        println!("{case_id} {lifecycle} {spec_id}");
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => report(err),
            }
        }
    }
}

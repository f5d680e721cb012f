//! Casegraph CLI
//!
//! Command-line interface for:
//! - Running extraction sessions over a directory of case files
//! - Inspecting the append-only session ledger
//! - Verifying finished sessions against the shared taxonomy
//! - Browsing the concept taxonomy with provenance

use anyhow::{bail, Context, Result};
use casegraph_pipeline::{CasePipeline, DirectoryCases, PipelineConfig};
use casegraph_store::{CaseId, Category, ConceptStore, SessionId, SessionStatus};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod workspace;

use workspace::DataDir;

#[derive(Parser)]
#[command(name = "casegraph")]
#[command(author, version, about = "Casegraph: multi-pass case concept extraction")]
struct Cli {
    /// Directory holding taxonomy.json and ledger.wal
    #[arg(long, global = true, env = "CASEGRAPH_DATA_DIR", default_value = ".casegraph")]
    data_dir: PathBuf,

    /// Pipeline configuration (TOML)
    #[arg(long, global = true, env = "CASEGRAPH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run extraction sessions for the given cases.
    Run {
        /// Case id (file stem under --cases-dir); repeatable
        #[arg(long = "case", required = true)]
        cases: Vec<String>,
        #[command(flatten)]
        provider: ProviderArgs,
    },

    /// Run every case found in --cases-dir.
    Batch {
        #[command(flatten)]
        provider: ProviderArgs,
    },

    /// Print the session report (status, aggregates, steps, entities) as JSON.
    Report { session_id: SessionId },

    /// Verify a session. Exits with code 2 when verification fails.
    Verify {
        session_id: SessionId,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List concept classes with provenance.
    Taxonomy {
        /// Restrict to one category (singular or plural)
        #[arg(long)]
        category: Option<String>,
    },

    /// List recorded sessions.
    Sessions {
        #[arg(long = "case")]
        case_id: Option<String>,
    },
}

#[derive(clap::Args)]
struct ProviderArgs {
    /// Directory of `<case_id>.json` files
    #[arg(long, default_value = "cases")]
    cases_dir: PathBuf,
    /// Override the configured model
    #[arg(long)]
    model: Option<String>,
    /// Override the configured endpoint base URL
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Override the worker pool size
    #[arg(long)]
    workers: Option<usize>,
}

impl ProviderArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(model) = &self.model {
            config.provider.model = model.clone();
        }
        if let Some(base_url) = &self.base_url {
            config.provider.base_url = base_url.clone();
        }
        if let Some(key) = &self.api_key {
            config.provider.api_key = Some(key.clone());
        }
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,casegraph=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;
    let data = DataDir::open(&cli.data_dir)?;

    match cli.command {
        Commands::Run { cases, provider } => {
            provider.apply(&mut config);
            let pipeline = data.live_pipeline(config, &provider.cases_dir)?;
            let case_ids: Vec<CaseId> = cases.into_iter().map(CaseId::from).collect();
            cmd_run(&pipeline, &case_ids).await
        }
        Commands::Batch { provider } => {
            provider.apply(&mut config);
            let case_ids = DirectoryCases::new(&provider.cases_dir)
                .list_cases()
                .with_context(|| format!("listing {}", provider.cases_dir.display()))?;
            if case_ids.is_empty() {
                bail!("no case files in {}", provider.cases_dir.display());
            }
            let pipeline = data.live_pipeline(config, &provider.cases_dir)?;
            cmd_run(&pipeline, &case_ids).await
        }
        Commands::Report { session_id } => {
            let pipeline = data.audit_pipeline(config)?;
            let report = pipeline.get_session_report(session_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Verify { session_id, json } => {
            let pipeline = data.audit_pipeline(config)?;
            cmd_verify(&pipeline, session_id, json).await
        }
        Commands::Taxonomy { category } => {
            let category = match category {
                Some(raw) => Some(raw.parse::<Category>()?),
                None => None,
            };
            cmd_taxonomy(&data, &config, category).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sessions { case_id } => {
            let pipeline = data.audit_pipeline(config)?;
            cmd_sessions(&pipeline, case_id.map(CaseId::from).as_ref());
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn cmd_run(pipeline: &CasePipeline, case_ids: &[CaseId]) -> Result<ExitCode> {
    println!(
        "{} {} case(s) with {} worker(s)",
        "Extracting".green().bold(),
        case_ids.len(),
        pipeline.config().worker_count
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling sessions");
            on_interrupt.cancel();
        }
    });

    let outcomes = pipeline.run_batch_with_cancel(case_ids, &cancel).await;
    let mut failures = 0;
    for outcome in outcomes {
        match outcome.result {
            Ok(session_id) => {
                let session = pipeline.get_session_report(session_id)?.session;
                let status = match session.status {
                    SessionStatus::Completed => "completed".green().bold(),
                    SessionStatus::Failed => {
                        failures += 1;
                        "failed".red().bold()
                    }
                    SessionStatus::InProgress => "in_progress".yellow().bold(),
                };
                println!(
                    "  {} {} {} {} ({} steps, {} entities)",
                    "→".cyan(),
                    outcome.case_id,
                    session_id,
                    status,
                    session.aggregates.total_steps,
                    session.aggregates.published_entities
                );
                if let Some(reason) = &session.failure_reason {
                    println!("    {} {}", "→".yellow(), reason);
                }
            }
            Err(e) => {
                failures += 1;
                println!("  {} {} {} {}", "→".cyan(), outcome.case_id, "error".red().bold(), e);
            }
        }
    }

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_verify(pipeline: &CasePipeline, session_id: SessionId, json: bool) -> Result<ExitCode> {
    let report = pipeline.verify_session(session_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let verdict = if report.passed {
            "ok".green().bold()
        } else {
            "FAILED".red().bold()
        };
        println!("{} {}", verdict, session_id);
        print!("{report}");
    }
    Ok(if report.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

async fn cmd_taxonomy(
    data: &DataDir,
    config: &PipelineConfig,
    category: Option<Category>,
) -> Result<()> {
    let store = data.store(config)?;
    let categories: Vec<Category> = match category {
        Some(c) => vec![c],
        None => Category::ALL.to_vec(),
    };
    for category in categories {
        let classes = store.list_by_category(category).await?;
        if classes.is_empty() {
            continue;
        }
        println!("{} ({})", category.plural().bold(), classes.len());
        for class in classes {
            let rederived: Vec<&str> = class.discovered_in_cases.iter().map(|c| c.as_str()).collect();
            println!(
                "  {} {}  first: {}{}",
                "→".cyan(),
                class.label,
                class.first_discovered_in_case,
                if rederived.is_empty() {
                    String::new()
                } else {
                    format!("  also: {}", rederived.join(", "))
                }
            );
            println!("    {}", class.id.dimmed());
        }
    }
    Ok(())
}

fn cmd_sessions(pipeline: &CasePipeline, case_id: Option<&CaseId>) {
    let sessions = pipeline.list_sessions(case_id);
    if sessions.is_empty() {
        println!("{} no sessions recorded", "info:".yellow().bold());
        return;
    }
    for session in sessions {
        let status = match session.status {
            SessionStatus::Completed => session.status.to_string().green(),
            SessionStatus::Failed => session.status.to_string().red(),
            SessionStatus::InProgress => session.status.to_string().yellow(),
        };
        println!(
            "{}  {:<16} {:<12} {}  steps={} entities={}",
            session.id,
            session.case_id.as_str(),
            status,
            session.started_at.format("%Y-%m-%d %H:%M:%S"),
            session.aggregates.total_steps,
            session.aggregates.published_entities
        );
    }
}

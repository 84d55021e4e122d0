//! notebook-agent CLI entry point.
//!
//! Every notebook subcommand opens a session against the backend, loads the
//! stored notebook, issues its commands through the session handle and
//! prints the result. The kernel is shut down afterwards even when a command
//! fails.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tabled::{settings::Style, Table, Tabled};

use notebook_agent::document::{Document, Position};
use notebook_agent::gateway::{HttpGateway, NotebookBackend};
use notebook_agent::protocol::NotebookListing;
use notebook_agent::reconciler::ToolStatus;
use notebook_agent::render::{render_document, render_transcript};
use notebook_agent::session::{spawn_session, LogSink, SessionHandle};
use notebook_agent::settings::{load_settings, save_settings, settings_path, Settings};

#[derive(Parser)]
#[command(name = "notebook-agent", author, version, about, long_about = None)]
struct Cli {
    /// Notebook backend URL (overrides the saved setting)
    #[arg(long, global = true, env = "NOTEBOOK_AGENT_BACKEND")]
    backend: Option<String>,

    /// Model for agent requests (overrides the saved setting)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the backend is reachable
    Health,
    /// List stored notebooks
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print a stored notebook
    Show { file: String },
    /// Run every code cell of a notebook in order
    Run {
        file: String,
        /// Stop at the first cell whose code raises
        #[arg(long)]
        stop_on_error: bool,
        /// Save the notebook (with outputs) afterwards
        #[arg(long)]
        save: bool,
    },
    /// Send one message to the agent and apply its tool calls
    Chat {
        file: String,
        message: String,
        #[arg(long)]
        save: bool,
    },
    /// Ask the agent why a cell failed
    Analyze {
        file: String,
        /// Cell id, or 0-based position in the notebook
        cell: String,
        /// Apply the proposed fixes
        #[arg(long)]
        apply: bool,
        #[arg(long)]
        save: bool,
    },
    /// Ask the agent to write a new cell
    Suggest {
        file: String,
        request: String,
        /// Insert the suggestion at the end of the notebook
        #[arg(long)]
        insert: bool,
        #[arg(long)]
        save: bool,
    },
    /// Ask the agent to review the whole notebook
    Review { file: String },
    /// Show or change saved settings
    Config {
        #[arg(long)]
        set_backend: Option<String>,
        #[arg(long)]
        set_model: Option<String>,
        #[arg(long)]
        set_timeout: Option<u64>,
    },
}

#[derive(Tabled)]
struct NotebookRow {
    #[tabled(rename = "NOTEBOOK")]
    filename: String,
    #[tabled(rename = "SIZE")]
    size: String,
    #[tabled(rename = "MODIFIED")]
    modified: String,
}

impl From<&NotebookListing> for NotebookRow {
    fn from(listing: &NotebookListing) -> Self {
        NotebookRow {
            filename: listing.filename.clone(),
            size: listing
                .size
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            modified: listing
                .modified_at()
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
struct SuggestionRow {
    #[tabled(rename = "CELL")]
    cell_id: String,
    #[tabled(rename = "PRIORITY")]
    priority: String,
    #[tabled(rename = "ISSUE")]
    issue: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = load_settings();
    if let Some(backend) = &cli.backend {
        settings.backend_url = backend.clone();
    }
    if let Some(model) = &cli.model {
        settings.default_model = model.clone();
    }

    let connect = |settings: &Settings| -> Result<HttpGateway> {
        info!("Using backend {}", settings.backend_url);
        Ok(HttpGateway::with_timeout(
            &settings.backend_url,
            settings.request_timeout(),
        )?)
    };

    match cli.command {
        Commands::Health => {
            let health = connect(&settings)?.health().await?;
            println!("{} {} ({})", health.status, health.version, health.message);
        }
        Commands::List { json } => {
            let notebooks = connect(&settings)?.list_notebooks().await?.notebooks;
            if json {
                println!("{}", serde_json::to_string_pretty(&notebooks)?);
            } else if notebooks.is_empty() {
                println!("No notebooks found.");
            } else {
                let rows: Vec<NotebookRow> = notebooks.iter().map(NotebookRow::from).collect();
                let table = Table::new(rows).with(Style::rounded()).to_string();
                println!("{}", table);
            }
        }
        Commands::Show { file } => {
            let session = open(connect(&settings)?, &settings, &file).await?;
            session.with_shutdown(print_notebook(&session)).await?;
        }
        Commands::Run {
            file,
            stop_on_error,
            save,
        } => {
            let session = open(connect(&settings)?, &settings, &file).await?;
            session
                .with_shutdown(async {
                    let summaries = session.run_all(stop_on_error).await?;
                    let raised = summaries.iter().filter(|s| s.raised).count();
                    print_notebook(&session).await?;
                    println!("Ran {} cells, {} raised", summaries.len(), raised);
                    save_if(&session, save).await
                })
                .await?;
        }
        Commands::Chat {
            file,
            message,
            save,
        } => {
            let session = open(connect(&settings)?, &settings, &file).await?;
            session
                .with_shutdown(async {
                    let outcome = session.chat(message, None).await?;
                    let skipped = outcome
                        .tools
                        .iter()
                        .filter(|t| t.status != ToolStatus::Applied)
                        .count();
                    print_notebook(&session).await?;
                    println!(
                        "{} tool calls, {} applied, {} skipped",
                        outcome.tools.len(),
                        outcome.tools.len() - skipped,
                        skipped
                    );
                    save_if(&session, save).await
                })
                .await?;
        }
        Commands::Analyze {
            file,
            cell,
            apply,
            save,
        } => {
            let session = open(connect(&settings)?, &settings, &file).await?;
            session
                .with_shutdown(async {
                    let cell_id = resolve_cell(&session, &cell).await?;
                    let analysis = session.analyze_error(&cell_id).await?;
                    println!("{}", analysis.analysis);
                    if !analysis.explanation.is_empty() {
                        println!("\n{}", analysis.explanation);
                    }
                    if apply {
                        let applied = session.apply_fixes(analysis).await?;
                        println!("\nApplied {} fixes", applied);
                        print_notebook(&session).await?;
                    }
                    save_if(&session, save).await
                })
                .await?;
        }
        Commands::Suggest {
            file,
            request,
            insert,
            save,
        } => {
            let session = open(connect(&settings)?, &settings, &file).await?;
            session
                .with_shutdown(async {
                    let suggestion = session.generate_code(request).await?;
                    println!("{}", suggestion.code);
                    if !suggestion.explanation.is_empty() {
                        println!("\n{}", suggestion.explanation);
                    }
                    if !suggestion.dependencies.is_empty() {
                        println!("\nRequires: {}", suggestion.dependencies.join(", "));
                    }
                    if insert {
                        let id = session.insert_generated(suggestion, Position::End).await?;
                        println!("\nInserted cell {}", id);
                    }
                    save_if(&session, save).await
                })
                .await?;
        }
        Commands::Review { file } => {
            let session = open(connect(&settings)?, &settings, &file).await?;
            session
                .with_shutdown(async {
                    let review = session.optimize().await?;
                    println!("{}", review.overall_assessment);
                    if !review.suggestions.is_empty() {
                        let rows: Vec<SuggestionRow> = review
                            .suggestions
                            .iter()
                            .map(|s| SuggestionRow {
                                cell_id: s.cell_id.clone(),
                                priority: s.priority.clone(),
                                issue: s.issue.clone(),
                            })
                            .collect();
                        let table = Table::new(rows).with(Style::rounded()).to_string();
                        println!("{}", table);
                    }
                    Ok::<_, anyhow::Error>(())
                })
                .await?;
        }
        Commands::Config {
            set_backend,
            set_model,
            set_timeout,
        } => {
            // Persist only what was asked for, not the command-line overrides.
            let mut saved = load_settings();
            configure(&mut saved, set_backend, set_model, set_timeout)?;
        }
    }

    Ok(())
}

fn configure(
    settings: &mut Settings,
    backend: Option<String>,
    model: Option<String>,
    timeout: Option<u64>,
) -> Result<()> {
    let changed = backend.is_some() || model.is_some() || timeout.is_some();
    if let Some(backend) = backend {
        url::Url::parse(&backend).with_context(|| format!("Invalid backend URL: {}", backend))?;
        settings.backend_url = backend;
    }
    if let Some(model) = model {
        settings.default_model = model;
    }
    if let Some(timeout) = timeout {
        settings.request_timeout_secs = timeout;
    }
    if changed {
        save_settings(settings)?;
        println!("Saved {}", settings_path().display());
    }
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}

/// Start a session and load `file` into it.
async fn open(gateway: HttpGateway, settings: &Settings, file: &str) -> Result<SessionHandle> {
    let session = spawn_session(
        Document::new(),
        gateway,
        settings.default_model.clone(),
        Arc::new(LogSink),
    );
    session
        .load(file)
        .await
        .with_context(|| format!("Failed to load {}", file))?;
    Ok(session)
}

/// Accept either a cell id or a 0-based position.
async fn resolve_cell(session: &SessionHandle, cell: &str) -> Result<String> {
    let doc = session.snapshot().await?.document;
    if doc.get(cell).is_some() {
        return Ok(cell.to_string());
    }
    if let Ok(index) = cell.parse::<usize>() {
        if let Some(id) = doc.cell_ids().get(index) {
            return Ok(id.clone());
        }
    }
    bail!("No cell {} in {}", cell, doc.notebook_name());
}

async fn print_notebook(session: &SessionHandle) -> Result<()> {
    let snapshot = session.snapshot().await?;
    print!(
        "{}",
        render_document(&snapshot.document, snapshot.kernel_status)
    );
    let transcript = render_transcript(&snapshot.document);
    if !transcript.is_empty() {
        println!();
        print!("{}", transcript);
    }
    Ok(())
}

/// Save when asked to.
async fn save_if(session: &SessionHandle, save: bool) -> Result<()> {
    if save {
        let filename = session.save().await?;
        println!("Saved {}", filename);
    }
    Ok(())
}

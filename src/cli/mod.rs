pub mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::adapters::db_docs::DbDocumentStore;
use crate::adapters::s3_objects::{S3ObjectStore, S3Settings};
use crate::adapters::{AdapterRegistry, AdapterSelection, Collection, DocumentQuery};
use crate::flow::{HandlerRegistry, JobQueue, JobState};
use crate::notify::NotificationBridge;
use crate::pipeline::{self, PassthroughAnnotator, PipelineDeps};

use config::AnnopipeConfig;

#[derive(Parser)]
#[command(name = "annopipe", version, about = "Annotation pipeline core")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to annopipe.yaml (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive an annotation run to its terminal state
    Annotate {
        /// Run document id
        run_id: String,
    },

    /// Cascade-delete a project and its dependent resources
    DeleteProject {
        /// Project document id
        project_id: String,
    },

    /// Cascade-delete a prompt collection and its dependent resources
    DeleteCollection {
        /// Collection document id
        collection_id: String,
    },

    /// Query documents in a collection
    Docs {
        /// Collection name (projects, runs, sessions, ...)
        collection: String,

        /// Match predicate as a JSON object
        #[arg(short, long)]
        matcher: Option<String>,
    },

    /// List registered adapters and the active selection
    Adapters,

    /// List registered job handlers
    Jobs,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = AnnopipeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Annotate { run_id } => cmd_annotate(&config, run_id).await,
        Commands::DeleteProject { project_id } => cmd_delete(&config, project_id, true).await,
        Commands::DeleteCollection { collection_id } => {
            cmd_delete(&config, collection_id, false).await
        }
        Commands::Docs {
            collection,
            matcher,
        } => cmd_docs(&config, collection, matcher).await,
        Commands::Adapters => cmd_adapters(&config).await,
        Commands::Jobs => cmd_jobs(&config).await,
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {
                // No .env file found — that's fine, silently skip
            }
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

struct App {
    adapters: Arc<AdapterRegistry>,
    queue: Arc<JobQueue>,
    handlers: Arc<HandlerRegistry>,
    deps: Arc<PipelineDeps>,
}

/// Assemble the registry, queue, and pipeline handlers from configuration.
async fn build_app(config: &AnnopipeConfig) -> Result<App> {
    let data_dir = config.data_dir.clone().unwrap_or_else(|| "data".to_string());
    let selection = AdapterSelection {
        documents: config.documents_adapter.clone(),
        objects: config.objects_adapter.clone(),
    };

    let mut registry = AdapterRegistry::bootstrap(&data_dir, selection);
    if let Some(ref url) = config.database_url {
        registry.register_documents(Arc::new(DbDocumentStore::connect(url).await?));
    }
    if let Some(ref s3) = config.s3 {
        registry.register_objects(Arc::new(
            S3ObjectStore::connect(S3Settings {
                bucket: s3.bucket.clone(),
                region: s3.region.clone(),
                endpoint_url: s3.endpoint_url.clone(),
                force_path_style: s3.force_path_style,
            })
            .await?,
        ));
    }
    let adapters = Arc::new(registry);

    let bridge = Arc::new(NotificationBridge::new());
    bridge.connect();

    let deps = Arc::new(PipelineDeps {
        adapters: adapters.clone(),
        bridge: bridge.clone(),
        annotator: Arc::new(PassthroughAnnotator),
    });

    let mut handlers = HandlerRegistry::new();
    pipeline::register_handlers(&mut handlers, deps.clone());
    let handlers = Arc::new(handlers);

    let queue = JobQueue::new();
    queue.start_workers(handlers.clone(), config.max_concurrent_jobs);

    Ok(App {
        adapters,
        queue,
        handlers,
        deps,
    })
}

async fn cmd_annotate(config: &AnnopipeConfig, run_id: String) -> Result<()> {
    let app = build_app(config).await?;

    let flow_id = pipeline::annotate::start_run_annotation(&app.deps, &app.queue, &run_id).await?;
    let job = app.queue.wait_until_terminal(&flow_id).await?;

    let run = app
        .adapters
        .documents()
        .get_document(&DocumentQuery::by_id(Collection::Runs, &run_id))
        .await?
        .with_context(|| format!("Run '{}' not found", run_id))?;

    println!("Run: {}", run_id);
    println!("Flow job: {} [{}]", flow_id, job.state);
    println!(
        "Complete: {}  Errored: {}",
        run.get("isComplete").and_then(|v| v.as_bool()).unwrap_or(false),
        run.get("hasErrored").and_then(|v| v.as_bool()).unwrap_or(false),
    );

    let sessions = app
        .adapters
        .documents()
        .get_documents(
            &DocumentQuery::new(Collection::Sessions)
                .matching(serde_json::json!({ "runId": run_id })),
        )
        .await?;
    if !sessions.data.is_empty() {
        println!("\nSessions:");
        for session in &sessions.data {
            let status = session
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("PENDING");
            let icon = match status {
                "COMPLETE" => "✓",
                "ERRORED" => "✗",
                "RUNNING" => "⟳",
                _ => "○",
            };
            println!(
                "  {} {} [{}]",
                icon,
                session.get("id").and_then(|v| v.as_str()).unwrap_or("-"),
                status
            );
        }
    }

    Ok(())
}

async fn cmd_delete(config: &AnnopipeConfig, id: String, is_project: bool) -> Result<()> {
    let app = build_app(config).await?;

    let flow_id = if is_project {
        pipeline::cascade::delete_project(&app.deps, &app.queue, &id).await?
    } else {
        pipeline::cascade::delete_collection(&app.deps, &app.queue, &id).await?
    };

    match flow_id {
        Some(flow_id) => {
            let job = app.queue.wait_until_terminal(&flow_id).await?;
            println!("Deleted: {}", id);
            println!(
                "Cleanup: {}",
                if job.state == JobState::Completed {
                    "finished"
                } else {
                    "failed, resource remains soft-deleted"
                }
            );
        }
        None => {
            println!(
                "Soft-deleted: {} (cleanup could not be enqueued, re-run to retry)",
                id
            );
        }
    }

    Ok(())
}

async fn cmd_docs(
    config: &AnnopipeConfig,
    collection: String,
    matcher: Option<String>,
) -> Result<()> {
    let app = build_app(config).await?;
    let collection = Collection::parse(&collection)?;

    let mut query = DocumentQuery::new(collection);
    if let Some(matcher) = matcher {
        query = query.matching(
            serde_json::from_str(&matcher).context("Failed to parse --matcher JSON")?,
        );
    }

    let page = app.adapters.documents().get_documents(&query).await?;
    println!("{}", serde_json::to_string_pretty(&page.data)?);
    println!("\nTotal: {} document(s)", page.total);

    Ok(())
}

async fn cmd_adapters(config: &AnnopipeConfig) -> Result<()> {
    let app = build_app(config).await?;

    let active_docs = app.adapters.documents().name().to_string();
    let active_objects = app.adapters.objects().name().to_string();

    println!("{:<12} {:<12} ACTIVE", "KIND", "ADAPTER");
    println!("{}", "-".repeat(36));
    for name in app.adapters.document_adapters() {
        let marker = if name == active_docs { "*" } else { "" };
        println!("{:<12} {:<12} {}", "documents", name, marker);
    }
    for name in app.adapters.object_adapters() {
        let marker = if name == active_objects { "*" } else { "" };
        println!("{:<12} {:<12} {}", "objects", name, marker);
    }

    Ok(())
}

async fn cmd_jobs(config: &AnnopipeConfig) -> Result<()> {
    let app = build_app(config).await?;

    println!("{:<24} DESCRIPTION", "JOB");
    println!("{}", "-".repeat(64));
    for (name, description) in app.handlers.list() {
        println!("{:<24} {}", name, description);
    }

    Ok(())
}

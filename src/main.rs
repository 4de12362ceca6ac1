use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use strategos_engine::config::{self, EngineConfig};
use strategos_engine::control::{ControlSurface, Engine};
use strategos_engine::log::parse_log_level;
use strategos_engine::pathway::PathwayRegistry;
use strategos_engine::pipeline;
use strategos_engine::strategos::HttpStrategosClient;
use strategos_engine::types::{ProjectConfig, SourceRegistryEntry};
use strategos_engine::{lock, log_error, log_info};

#[derive(Parser)]
#[command(name = "strategos", about = "Research pipeline orchestration engine")]
struct Cli {
    /// Data root directory (projects/, sources.json, research-index.json)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/strategos.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of pathway definition JSON files
    #[arg(long, default_value = "./pathways")]
    pathways: PathBuf,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new research project
    Create {
        /// Research topic
        topic: String,
        /// Investigation budget (0-50)
        #[arg(long, default_value = "10")]
        budget: u32,
    },
    /// Drive a project through the full phase state machine
    Run {
        /// Project id
        id: String,
    },
    /// Show one project's status
    Status {
        /// Project id
        id: String,
    },
    /// List all known projects
    List,
    /// Delete a project and its artifacts
    Delete {
        /// Project id
        id: String,
    },
    /// Pause a running project at its next cooperative checkpoint
    Pause {
        /// Project id
        id: String,
    },
    /// Resume a paused project from a given phase
    Resume {
        /// Project id
        id: String,
        /// Phase to resume from (plan, classify, investigate, adjudicate, synthesize)
        #[arg(long, default_value = "plan")]
        from_phase: String,
    },
    /// Print a project's knowledge graph
    Graph {
        /// Project id
        id: String,
    },
    /// Source registry operations
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },
    /// Research index operations
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
}

#[derive(Subcommand)]
enum SourcesAction {
    /// List every registered source
    List,
    /// Show one source
    Get { id: String },
    /// Insert or replace a source (reads a JSON `SourceRegistryEntry` from stdin)
    Upsert,
    /// Remove a source
    Delete { id: String },
    /// Match sources against a topic
    Match {
        topic: String,
        #[arg(long, default_value = "5")]
        max_results: usize,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// List every entry in the cross-project research index
    List,
    /// Search the cross-project research index
    Search {
        query: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Rebuild the index from every completed project on disk
    Rebuild,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => strategos_engine::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let result = run(cli).await;
    if let Err(e) = result {
        log_error!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let engine_config = config::load_config_from(cli.config.as_deref(), &cli.root)?;

    match cli.command {
        Commands::Create { topic, budget } => handle_create(&engine_config, &cli.pathways, topic, budget).await,
        Commands::Run { id } => handle_run(&engine_config, &cli.pathways, &id).await,
        Commands::Status { id } => handle_status(&engine_config, &cli.pathways, &id).await,
        Commands::List => handle_list(&engine_config, &cli.pathways).await,
        Commands::Delete { id } => handle_delete(&engine_config, &cli.pathways, &id).await,
        Commands::Pause { id } => handle_pause(&engine_config, &cli.pathways, &id).await,
        Commands::Resume { id, from_phase } => {
            handle_resume(&engine_config, &cli.pathways, &id, &from_phase).await
        }
        Commands::Graph { id } => handle_graph(&engine_config, &cli.pathways, &id).await,
        Commands::Sources { action } => handle_sources(&engine_config, &cli.pathways, action).await,
        Commands::Index { action } => handle_index(&engine_config, &cli.pathways, action).await,
    }
}

fn runtime_lock_dir(config: &EngineConfig) -> PathBuf {
    config.data_root.join(".strategos")
}

/// Builds the in-process `ControlSurface` the whole CLI drives. A missing
/// `--pathways` directory degrades to an empty registry rather than a hard
/// error, since read-only commands (`status`, `list`, `sources`, `index`...)
/// have no pathway to run and shouldn't require one to exist on disk.
async fn build_engine(config: &EngineConfig, pathways_dir: &Path) -> Result<Arc<dyn ControlSurface>, String> {
    let client = Arc::new(HttpStrategosClient::new(config.worker_runtime_base_url.clone()));
    let pathways = Arc::new(if pathways_dir.is_dir() {
        PathwayRegistry::load_dir(pathways_dir)
            .map_err(|e| format!("failed to load pathways from {}: {}", pathways_dir.display(), e))?
    } else {
        PathwayRegistry::from_pathways(vec![]).map_err(|e| e.to_string())?
    });
    let engine = Engine::build(config.clone(), client, pathways)
        .await
        .map_err(|e| e.to_string())?;
    Ok(engine)
}

async fn handle_create(config: &EngineConfig, pathways_dir: &Path, topic: String, budget: u32) -> Result<(), String> {
    let engine = build_engine(config, pathways_dir).await?;
    let project_config = ProjectConfig { investigation_budget: budget };
    let project = engine.create_project(topic, project_config).await.map_err(|e| e.to_string())?;
    println!("Created project {} ({})", project.id, project.topic);
    Ok(())
}

async fn handle_run(config: &EngineConfig, pathways_dir: &Path, id: &str) -> Result<(), String> {
    let _lock = lock::try_acquire(&runtime_lock_dir(config))?;
    let engine = build_engine(config, pathways_dir).await?;
    log_info!("[run] driving project {} through the pipeline", id);
    engine.run_project(id).await.map_err(|e| e.to_string())?;
    let project = engine.get_project(id).await.map_err(|e| e.to_string())?;
    println!("Project {} finished with status {}", project.id, project.status);
    Ok(())
}

async fn handle_status(config: &EngineConfig, pathways_dir: &Path, id: &str) -> Result<(), String> {
    let engine = build_engine(config, pathways_dir).await?;
    let project = engine.get_project(id).await.map_err(|e| e.to_string())?;
    println!("{:<36} {:<14} {}", project.id, project.status.to_string(), project.topic);
    if let Some(err) = &project.last_error {
        println!("last error: {}", err);
    }
    println!("artifacts: {}", project.artifacts.join(", "));
    Ok(())
}

async fn handle_list(config: &EngineConfig, pathways_dir: &Path) -> Result<(), String> {
    let engine = build_engine(config, pathways_dir).await?;
    let projects = engine.list_projects().await.map_err(|e| e.to_string())?;
    if projects.is_empty() {
        println!("No projects.");
        return Ok(());
    }
    println!("{:<36} {:<14} TOPIC", "ID", "STATUS");
    for project in &projects {
        println!("{:<36} {:<14} {}", project.id, project.status.to_string(), project.topic);
    }
    Ok(())
}

async fn handle_delete(config: &EngineConfig, pathways_dir: &Path, id: &str) -> Result<(), String> {
    let engine = build_engine(config, pathways_dir).await?;
    engine.delete_project(id).await.map_err(|e| e.to_string())?;
    println!("Deleted project {}", id);
    Ok(())
}

async fn handle_pause(config: &EngineConfig, pathways_dir: &Path, id: &str) -> Result<(), String> {
    let engine = build_engine(config, pathways_dir).await?;
    let project = engine.pause_project(id).await.map_err(|e| e.to_string())?;
    println!("Paused project {} (status {})", project.id, project.status);
    Ok(())
}

async fn handle_resume(
    config: &EngineConfig,
    pathways_dir: &Path,
    id: &str,
    from_phase: &str,
) -> Result<(), String> {
    let _lock = lock::try_acquire(&runtime_lock_dir(config))?;
    let phase = pipeline::parse_phase(from_phase)?;
    let engine = build_engine(config, pathways_dir).await?;
    engine.resume_project(id, phase).await.map_err(|e| e.to_string())?;
    let project = engine.get_project(id).await.map_err(|e| e.to_string())?;
    println!("Project {} finished with status {}", project.id, project.status);
    Ok(())
}

async fn handle_graph(config: &EngineConfig, pathways_dir: &Path, id: &str) -> Result<(), String> {
    let engine = build_engine(config, pathways_dir).await?;
    let graph = engine.get_graph(id).await.map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&graph).map_err(|e| e.to_string())?;
    println!("{}", json);
    Ok(())
}

async fn handle_sources(config: &EngineConfig, pathways_dir: &Path, action: SourcesAction) -> Result<(), String> {
    let engine = build_engine(config, pathways_dir).await?;
    match action {
        SourcesAction::List => {
            for entry in engine.list_sources().await {
                println!("{:<16} {:<24} {}", entry.id, entry.name, entry.tags.join(", "));
            }
        }
        SourcesAction::Get { id } => {
            let entry = engine.get_source(&id).await.map_err(|e| e.to_string())?;
            println!("{}", serde_json::to_string_pretty(&entry).map_err(|e| e.to_string())?);
        }
        SourcesAction::Upsert => {
            let entry: SourceRegistryEntry = serde_json::from_reader(std::io::stdin())
                .map_err(|e| format!("invalid source entry on stdin: {}", e))?;
            engine.upsert_source(entry.clone()).await.map_err(|e| e.to_string())?;
            println!("Upserted source {}", entry.id);
        }
        SourcesAction::Delete { id } => {
            engine.delete_source(&id).await.map_err(|e| e.to_string())?;
            println!("Deleted source {}", id);
        }
        SourcesAction::Match { topic, max_results } => {
            for entry in engine.match_sources(&topic, max_results).await {
                println!("{:<16} {}", entry.id, entry.name);
            }
        }
    }
    Ok(())
}

async fn handle_index(config: &EngineConfig, pathways_dir: &Path, action: IndexAction) -> Result<(), String> {
    let engine = build_engine(config, pathways_dir).await?;
    match action {
        IndexAction::List => {
            let entries = engine.get_index().await;
            if entries.is_empty() {
                println!("Index is empty.");
            }
            for entry in entries {
                println!("{:<36} {}", entry.project_id, entry.topic);
            }
        }
        IndexAction::Search { query, limit } => {
            let entries = engine.search_index(&query, limit).await;
            if entries.is_empty() {
                println!("No matching projects.");
            }
            for entry in entries {
                println!("{:<36} {}", entry.project_id, entry.topic);
            }
        }
        IndexAction::Rebuild => {
            engine.rebuild_index().await.map_err(|e| e.to_string())?;
            println!("Rebuilt the research index.");
        }
    }
    Ok(())
}

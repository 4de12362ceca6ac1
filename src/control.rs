use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event_bus::{Event, EventBus};
use crate::pathway::PathwayRegistry;
use crate::pipeline::{Phase, PipelineEngine};
use crate::research_index::{ResearchIndex, ResearchIndexEntry};
use crate::source_matcher::{self, SourceRegistry};
use crate::store::ProjectStore;
use crate::strategos::StrategosClient;
use crate::types::{Graph, Project, ProjectConfig, SourceRegistryEntry};

/// The minimal, stable, protocol-agnostic API a front end drives (§6.2):
/// project lifecycle, event subscription, source registry CRUD, and the
/// cross-project research index. Kept as a trait rather than inherent
/// methods on one concrete struct so the eventual HTTP/RPC transport layer
/// (out of scope here) can depend on this boundary instead of the engine's
/// internals.
#[async_trait]
pub trait ControlSurface: Send + Sync {
    async fn create_project(&self, topic: String, config: ProjectConfig) -> Result<Project, EngineError>;
    async fn get_project(&self, id: &str) -> Result<Project, EngineError>;
    async fn list_projects(&self) -> Result<Vec<Project>, EngineError>;
    async fn delete_project(&self, id: &str) -> Result<(), EngineError>;
    async fn pause_project(&self, id: &str) -> Result<Project, EngineError>;
    async fn unpause_project(&self, id: &str) -> Result<Project, EngineError>;
    async fn resume_project(&self, id: &str, from_phase: Phase) -> Result<(), EngineError>;
    async fn run_project(&self, id: &str) -> Result<(), EngineError>;
    async fn get_graph(&self, id: &str) -> Result<Graph, EngineError>;
    async fn subscribe_events(&self, id: &str) -> mpsc::Receiver<Event>;

    async fn list_sources(&self) -> Vec<SourceRegistryEntry>;
    async fn get_source(&self, id: &str) -> Result<SourceRegistryEntry, EngineError>;
    async fn upsert_source(&self, entry: SourceRegistryEntry) -> Result<(), EngineError>;
    async fn delete_source(&self, id: &str) -> Result<(), EngineError>;
    async fn match_sources(&self, topic: &str, max_results: usize) -> Vec<SourceRegistryEntry>;

    async fn get_index(&self) -> Vec<ResearchIndexEntry>;
    async fn search_index(&self, query: &str, limit: usize) -> Vec<ResearchIndexEntry>;
    async fn rebuild_index(&self) -> Result<(), EngineError>;
}

/// In-process `ControlSurface` implementation. Owns the same `ProjectStore`
/// and `EventBus` handed to `PipelineEngine` so a subscriber sees the events
/// the pipeline publishes while investigating and synthesizing.
pub struct Engine {
    pipeline: Arc<PipelineEngine>,
    store: Arc<ProjectStore>,
    events: Arc<EventBus>,
    sources: Arc<SourceRegistry>,
    index: Arc<ResearchIndex>,
}

impl Engine {
    pub async fn build(
        config: EngineConfig,
        client: Arc<dyn StrategosClient>,
        pathways: Arc<PathwayRegistry>,
    ) -> Result<Arc<Engine>, EngineError> {
        let store = ProjectStore::new(config.data_root.clone());
        let events = EventBus::new();
        let index = Arc::new(ResearchIndex::load(&config.data_root).await?);
        let sources = Arc::new(SourceRegistry::load(&config.data_root).await?);
        let pipeline = PipelineEngine::new(store.clone(), client, events.clone(), pathways, index.clone(), config);
        Ok(Arc::new(Engine {
            pipeline,
            store,
            events,
            sources,
            index,
        }))
    }
}

#[async_trait]
impl ControlSurface for Engine {
    async fn create_project(&self, topic: String, config: ProjectConfig) -> Result<Project, EngineError> {
        self.pipeline.create_project(topic, config).await
    }

    async fn get_project(&self, id: &str) -> Result<Project, EngineError> {
        self.pipeline.get_project(id).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, EngineError> {
        self.pipeline.list_projects().await
    }

    async fn delete_project(&self, id: &str) -> Result<(), EngineError> {
        self.pipeline.delete_project(id).await
    }

    async fn pause_project(&self, id: &str) -> Result<Project, EngineError> {
        self.pipeline.pause_project(id).await
    }

    async fn unpause_project(&self, id: &str) -> Result<Project, EngineError> {
        self.store.unpause_to_prior(id).await
    }

    async fn resume_project(&self, id: &str, from_phase: Phase) -> Result<(), EngineError> {
        self.pipeline.resume_project(id, from_phase).await
    }

    async fn run_project(&self, id: &str) -> Result<(), EngineError> {
        self.pipeline.run_project(id).await
    }

    async fn get_graph(&self, id: &str) -> Result<Graph, EngineError> {
        self.pipeline.get_graph(id).await
    }

    async fn subscribe_events(&self, id: &str) -> mpsc::Receiver<Event> {
        self.events.subscribe(id).await
    }

    async fn list_sources(&self) -> Vec<SourceRegistryEntry> {
        self.sources.list().await
    }

    async fn get_source(&self, id: &str) -> Result<SourceRegistryEntry, EngineError> {
        self.sources.get(id).await
    }

    async fn upsert_source(&self, entry: SourceRegistryEntry) -> Result<(), EngineError> {
        self.sources.upsert(entry).await
    }

    async fn delete_source(&self, id: &str) -> Result<(), EngineError> {
        self.sources.delete(id).await
    }

    async fn match_sources(&self, topic: &str, max_results: usize) -> Vec<SourceRegistryEntry> {
        let sources = self.sources.list().await;
        source_matcher::match_sources(topic, &sources, max_results)
            .into_iter()
            .cloned()
            .collect()
    }

    async fn get_index(&self) -> Vec<ResearchIndexEntry> {
        self.index.all().await
    }

    async fn search_index(&self, query: &str, limit: usize) -> Vec<ResearchIndexEntry> {
        self.index.search(query, limit).await
    }

    async fn rebuild_index(&self) -> Result<(), EngineError> {
        let projects = self.store.list().await?;
        let mut completed = Vec::new();
        for project in projects {
            if let Ok(graph) = self.store.get_graph(&project.id).await {
                completed.push((project, graph));
            }
        }
        self.index.rebuild(&completed).await
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::EngineError;
use crate::types::{Project, ProjectConfig, ProjectStatus};
use crate::log_warn;

const CHANNEL_CAPACITY: usize = 32;

/// Commands serialized through a single project's actor. Each project gets
/// its own task and channel so unrelated projects never wait on each other.
enum ProjectCommand {
    Init {
        topic: String,
        config: ProjectConfig,
        reply: oneshot::Sender<Result<Project, EngineError>>,
    },
    Get {
        reply: oneshot::Sender<Result<Project, EngineError>>,
    },
    SetStatus {
        status: ProjectStatus,
        last_error: Option<String>,
        reply: oneshot::Sender<Result<Project, EngineError>>,
    },
    Pause {
        reply: oneshot::Sender<Result<Project, EngineError>>,
    },
    UnpauseToPrior {
        reply: oneshot::Sender<Result<Project, EngineError>>,
    },
    WriteArtifact {
        relative_path: String,
        value: serde_json::Value,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    ReadArtifact {
        relative_path: String,
        reply: oneshot::Sender<Result<serde_json::Value, EngineError>>,
    },
    Remove {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

#[derive(Clone)]
struct ProjectHandle {
    sender: mpsc::Sender<ProjectCommand>,
}

impl ProjectHandle {
    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> ProjectCommand,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| EngineError::InvariantViolation("project actor shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::InvariantViolation("project actor dropped reply".into()))?
    }
}

struct ProjectActorState {
    dir: PathBuf,
    project: Option<Project>,
}

impl ProjectActorState {
    fn project_path(&self) -> PathBuf {
        self.dir.join("project.json")
    }

    fn load_project(&self) -> Result<Project, EngineError> {
        let path = self.project_path();
        let contents = std::fs::read_to_string(&path)?;
        serde_json::from_str(&contents)
            .map_err(|e| EngineError::InvariantViolation(format!("corrupt project.json: {}", e)))
    }

    fn save_project(&self, project: &Project) -> Result<(), EngineError> {
        write_json_atomic(&self.project_path(), project)
    }
}

pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), EngineError> {
    let parent = path
        .parent()
        .ok_or_else(|| EngineError::InvalidInput(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| EngineError::InvariantViolation(format!("failed to serialize json: {}", e)))?;

    let temp_file = NamedTempFile::new_in(parent)?;
    std::fs::write(temp_file.path(), json.as_bytes())?;

    let file = std::fs::File::open(temp_file.path())?;
    file.sync_all()?;

    temp_file
        .persist(path)
        .map_err(|e| EngineError::Io(format!("failed to rename into {}: {}", path.display(), e)))?;

    Ok(())
}

fn handle_init(
    state: &mut ProjectActorState,
    id: &str,
    topic: String,
    config: ProjectConfig,
) -> Result<Project, EngineError> {
    if state.project_path().exists() {
        return Err(EngineError::InvalidInput(format!(
            "project {} already exists",
            id
        )));
    }
    config
        .validate()
        .map_err(EngineError::InvalidInput)?;
    let project = Project::new(id.to_string(), topic, config);
    state.save_project(&project)?;
    state.project = Some(project.clone());
    Ok(project)
}

fn handle_get(state: &mut ProjectActorState) -> Result<Project, EngineError> {
    if let Some(p) = &state.project {
        return Ok(p.clone());
    }
    let project = state.load_project()?;
    state.project = Some(project.clone());
    Ok(project)
}

fn handle_set_status(
    state: &mut ProjectActorState,
    status: ProjectStatus,
    last_error: Option<String>,
) -> Result<Project, EngineError> {
    let mut project = handle_get(state)?;
    project.status = status;
    project.last_error = last_error;
    project.updated = chrono::Utc::now().to_rfc3339();
    state.save_project(&project)?;
    state.project = Some(project.clone());
    Ok(project)
}

/// Records the status a bare `unpause_to_prior` should restore, then sets
/// the project to `Paused`.
fn handle_pause(state: &mut ProjectActorState) -> Result<Project, EngineError> {
    let mut project = handle_get(state)?;
    project.pre_pause_status = Some(project.status);
    project.status = ProjectStatus::Paused;
    project.updated = chrono::Utc::now().to_rfc3339();
    state.save_project(&project)?;
    state.project = Some(project.clone());
    Ok(project)
}

/// Restores the status recorded by `handle_pause`, consuming it. A project
/// that was never paused restores to `Pending` as a harmless default.
fn handle_unpause_to_prior(state: &mut ProjectActorState) -> Result<Project, EngineError> {
    let mut project = handle_get(state)?;
    project.status = project.pre_pause_status.take().unwrap_or(ProjectStatus::Pending);
    project.updated = chrono::Utc::now().to_rfc3339();
    state.save_project(&project)?;
    state.project = Some(project.clone());
    Ok(project)
}

fn handle_write_artifact(
    state: &mut ProjectActorState,
    relative_path: &str,
    value: &serde_json::Value,
) -> Result<(), EngineError> {
    let path = resolve_artifact_path(&state.dir, relative_path)?;
    write_json_atomic(&path, value)?;

    let mut project = handle_get(state)?;
    if !project.artifacts.iter().any(|p| p == relative_path) {
        project.artifacts.push(relative_path.to_string());
        project.updated = chrono::Utc::now().to_rfc3339();
        state.save_project(&project)?;
        state.project = Some(project);
    }
    Ok(())
}

fn handle_read_artifact(
    state: &ProjectActorState,
    relative_path: &str,
) -> Result<serde_json::Value, EngineError> {
    let path = resolve_artifact_path(&state.dir, relative_path)?;
    if !path.exists() {
        return Err(EngineError::NotFound(format!(
            "artifact {} not found",
            relative_path
        )));
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_json::from_str(&contents)
        .map_err(|e| EngineError::InvariantViolation(format!("corrupt artifact {}: {}", relative_path, e)))
}

/// Artifact paths are always relative and must stay within the project
/// directory — rejects `..` segments to keep writes confined to `dir`.
fn resolve_artifact_path(dir: &Path, relative_path: &str) -> Result<PathBuf, EngineError> {
    if relative_path
        .split('/')
        .any(|segment| segment == ".." || segment.is_empty())
    {
        return Err(EngineError::InvalidInput(format!(
            "invalid artifact path: {}",
            relative_path
        )));
    }
    Ok(dir.join(relative_path))
}

fn handle_remove(state: &ProjectActorState) -> Result<(), EngineError> {
    if state.dir.exists() {
        std::fs::remove_dir_all(&state.dir)?;
    }
    Ok(())
}

async fn run_project_actor(mut rx: mpsc::Receiver<ProjectCommand>, dir: PathBuf) {
    let mut state = ProjectActorState { dir, project: None };

    while let Some(cmd) = rx.recv().await {
        match cmd {
            ProjectCommand::Init {
                topic,
                config,
                reply,
            } => {
                let id = state
                    .dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let result = handle_init(&mut state, &id, topic, config);
                let _ = reply.send(result);
            }
            ProjectCommand::Get { reply } => {
                let result = handle_get(&mut state);
                let _ = reply.send(result);
            }
            ProjectCommand::SetStatus {
                status,
                last_error,
                reply,
            } => {
                let result = handle_set_status(&mut state, status, last_error);
                let _ = reply.send(result);
            }
            ProjectCommand::Pause { reply } => {
                let result = handle_pause(&mut state);
                let _ = reply.send(result);
            }
            ProjectCommand::UnpauseToPrior { reply } => {
                let result = handle_unpause_to_prior(&mut state);
                let _ = reply.send(result);
            }
            ProjectCommand::WriteArtifact {
                relative_path,
                value,
                reply,
            } => {
                let result = handle_write_artifact(&mut state, &relative_path, &value);
                let _ = reply.send(result);
            }
            ProjectCommand::ReadArtifact {
                relative_path,
                reply,
            } => {
                let result = handle_read_artifact(&state, &relative_path);
                let _ = reply.send(result);
            }
            ProjectCommand::Remove { reply } => {
                let result = handle_remove(&state);
                let _ = reply.send(result);
            }
        }
    }
}

/// Registry of per-project actors. Lazily spawns one actor per project id,
/// so mutations to unrelated projects never contend on the same mutex.
pub struct ProjectStore {
    data_root: PathBuf,
    actors: Mutex<HashMap<String, ProjectHandle>>,
}

impl ProjectStore {
    pub fn new(data_root: PathBuf) -> Arc<ProjectStore> {
        Arc::new(ProjectStore {
            data_root,
            actors: Mutex::new(HashMap::new()),
        })
    }

    fn project_dir(&self, id: &str) -> PathBuf {
        self.data_root.join("projects").join(id)
    }

    async fn handle_for(&self, id: &str) -> ProjectHandle {
        let mut actors = self.actors.lock().await;
        if let Some(handle) = actors.get(id) {
            return handle.clone();
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run_project_actor(rx, self.project_dir(id)));
        let handle = ProjectHandle { sender: tx };
        actors.insert(id.to_string(), handle.clone());
        handle
    }

    pub async fn create(&self, id: &str, topic: String, config: ProjectConfig) -> Result<Project, EngineError> {
        let handle = self.handle_for(id).await;
        handle
            .send(|reply| ProjectCommand::Init {
                topic,
                config,
                reply,
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Project, EngineError> {
        if !self.project_dir(id).exists() {
            return Err(EngineError::NotFound(format!("project {} not found", id)));
        }
        let handle = self.handle_for(id).await;
        handle.send(|reply| ProjectCommand::Get { reply }).await
    }

    /// Scans the data root directly rather than routing through actors —
    /// `project.json` is always written atomically, so a direct read never
    /// observes a torn file.
    pub async fn list(&self) -> Result<Vec<Project>, EngineError> {
        let projects_dir = self.data_root.join("projects");
        if !projects_dir.exists() {
            return Ok(Vec::new());
        }
        let mut projects = Vec::new();
        let mut entries = tokio::fs::read_dir(&projects_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let project_json = entry.path().join("project.json");
            if !project_json.exists() {
                continue;
            }
            let contents = tokio::fs::read_to_string(&project_json).await?;
            match serde_json::from_str::<Project>(&contents) {
                Ok(project) => projects.push(project),
                Err(e) => log_warn!(
                    "skipping unreadable project at {}: {}",
                    project_json.display(),
                    e
                ),
            }
        }
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: ProjectStatus,
        last_error: Option<String>,
    ) -> Result<Project, EngineError> {
        let handle = self.handle_for(id).await;
        handle
            .send(|reply| ProjectCommand::SetStatus {
                status,
                last_error,
                reply,
            })
            .await
    }

    /// Pauses a project, remembering its current status so a bare
    /// `unpause_to_prior` (no explicit target phase) can restore it.
    pub async fn pause(&self, id: &str) -> Result<Project, EngineError> {
        let handle = self.handle_for(id).await;
        handle.send(|reply| ProjectCommand::Pause { reply }).await
    }

    /// Resumes into an explicit status, used when the caller is about to
    /// drive a specific phase (`PipelineEngine::resume_project`).
    pub async fn unpause(&self, id: &str, resume_status: ProjectStatus) -> Result<Project, EngineError> {
        self.set_status(id, resume_status, None).await
    }

    /// Bare `UnpauseProject(id)` (§6.2): restores whatever status the
    /// project held before it was paused, without driving any phase.
    pub async fn unpause_to_prior(&self, id: &str) -> Result<Project, EngineError> {
        let handle = self.handle_for(id).await;
        handle.send(|reply| ProjectCommand::UnpauseToPrior { reply }).await
    }

    pub async fn write_artifact(
        &self,
        id: &str,
        relative_path: &str,
        value: serde_json::Value,
    ) -> Result<(), EngineError> {
        let handle = self.handle_for(id).await;
        handle
            .send(|reply| ProjectCommand::WriteArtifact {
                relative_path: relative_path.to_string(),
                value,
                reply,
            })
            .await
    }

    pub async fn read_artifact(
        &self,
        id: &str,
        relative_path: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let handle = self.handle_for(id).await;
        handle
            .send(|reply| ProjectCommand::ReadArtifact {
                relative_path: relative_path.to_string(),
                reply,
            })
            .await
    }

    pub async fn get_graph(&self, id: &str) -> Result<crate::types::Graph, EngineError> {
        let value = self.read_artifact(id, "graph.json").await?;
        serde_json::from_value(value)
            .map_err(|e| EngineError::InvariantViolation(format!("corrupt graph.json: {}", e)))
    }

    pub async fn remove(&self, id: &str) -> Result<(), EngineError> {
        if !self.project_dir(id).exists() {
            return Err(EngineError::NotFound(format!("project {} not found", id)));
        }
        let handle = self.handle_for(id).await;
        let result = handle.send(|reply| ProjectCommand::Remove { reply }).await;
        self.actors.lock().await.remove(id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().to_path_buf());
        let project = store
            .create("proj-1", "microplastics".to_string(), ProjectConfig::default())
            .await
            .unwrap();
        assert_eq!(project.status, ProjectStatus::Pending);

        let fetched = store.get("proj-1").await.unwrap();
        assert_eq!(fetched.topic, "microplastics");
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().to_path_buf());
        store
            .create("proj-1", "topic".to_string(), ProjectConfig::default())
            .await
            .unwrap();
        let result = store
            .create("proj-1", "topic".to_string(), ProjectConfig::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn get_missing_project_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().to_path_buf());
        let result = store.get("missing").await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn write_then_read_artifact_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().to_path_buf());
        store
            .create("proj-1", "topic".to_string(), ProjectConfig::default())
            .await
            .unwrap();

        store
            .write_artifact("proj-1", "plan.json", serde_json::json!({"sub_questions": []}))
            .await
            .unwrap();

        let value = store.read_artifact("proj-1", "plan.json").await.unwrap();
        assert_eq!(value["sub_questions"], serde_json::json!([]));

        let project = store.get("proj-1").await.unwrap();
        assert!(project.artifacts.contains(&"plan.json".to_string()));
    }

    #[tokio::test]
    async fn artifact_path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().to_path_buf());
        store
            .create("proj-1", "topic".to_string(), ProjectConfig::default())
            .await
            .unwrap();

        let result = store
            .write_artifact("proj-1", "../escape.json", serde_json::json!({}))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_returns_all_known_projects() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().to_path_buf());
        store
            .create("proj-a", "a".to_string(), ProjectConfig::default())
            .await
            .unwrap();
        store
            .create("proj-b", "b".to_string(), ProjectConfig::default())
            .await
            .unwrap();

        let projects = store.list().await.unwrap();
        assert_eq!(projects.len(), 2);
    }

    #[tokio::test]
    async fn remove_deletes_project_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().to_path_buf());
        store
            .create("proj-1", "topic".to_string(), ProjectConfig::default())
            .await
            .unwrap();

        store.remove("proj-1").await.unwrap();
        assert!(store.get("proj-1").await.is_err());
    }

    #[tokio::test]
    async fn pause_then_unpause_to_prior_restores_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().to_path_buf());
        store
            .create("proj-1", "topic".to_string(), ProjectConfig::default())
            .await
            .unwrap();
        store.set_status("proj-1", ProjectStatus::Investigating, None).await.unwrap();

        let paused = store.pause("proj-1").await.unwrap();
        assert_eq!(paused.status, ProjectStatus::Paused);

        let restored = store.unpause_to_prior("proj-1").await.unwrap();
        assert_eq!(restored.status, ProjectStatus::Investigating);

        let reloaded = store.get("proj-1").await.unwrap();
        assert_eq!(reloaded.pre_pause_status, None);
    }

    #[tokio::test]
    async fn unpause_to_prior_without_a_pause_defaults_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().to_path_buf());
        store
            .create("proj-1", "topic".to_string(), ProjectConfig::default())
            .await
            .unwrap();

        let restored = store.unpause_to_prior("proj-1").await.unwrap();
        assert_eq!(restored.status, ProjectStatus::Pending);
    }
}

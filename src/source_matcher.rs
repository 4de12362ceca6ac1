use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::research_index::tokenize;
use crate::store::write_json_atomic;
use crate::types::{SourceRegistryEntry, SourceRegistryFile};

const MIN_SCORE: f64 = 1.0;
const REGISTRY_FILE_NAME: &str = "sources.json";

/// Read/write access to the flat `sources.json` registry at the data root.
/// The core reads and (per the control surface) edits this file, but never
/// derives its contents — curation is an external concern; this is just the
/// CRUD surface the front end drives.
pub struct SourceRegistry {
    path: PathBuf,
    entries: RwLock<Vec<SourceRegistryEntry>>,
}

impl SourceRegistry {
    /// Loads `data_root/sources.json`; a missing file is an empty registry.
    pub async fn load(data_root: &Path) -> Result<Self, EngineError> {
        let path = data_root.join(REGISTRY_FILE_NAME);
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let file: SourceRegistryFile = serde_json::from_str(&contents)
                .map_err(|e| EngineError::InvalidInput(format!("invalid {}: {}", REGISTRY_FILE_NAME, e)))?;
            file.sources
        } else {
            Vec::new()
        };
        Ok(SourceRegistry {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub async fn list(&self) -> Vec<SourceRegistryEntry> {
        self.entries.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Result<SourceRegistryEntry, EngineError> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("source {} not found", id)))
    }

    /// Idempotent insert/replace keyed on `id`, preserving registry insertion
    /// order for existing entries so `match_sources`'s tie-break stays stable.
    pub async fn upsert(&self, entry: SourceRegistryEntry) -> Result<(), EngineError> {
        if entry.id.trim().is_empty() {
            return Err(EngineError::InvalidInput("source id must not be empty".into()));
        }
        {
            let mut guard = self.entries.write().await;
            match guard.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry,
                None => guard.push(entry),
            }
        }
        self.persist().await
    }

    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        let removed = {
            let mut guard = self.entries.write().await;
            let before = guard.len();
            guard.retain(|e| e.id != id);
            guard.len() != before
        };
        if !removed {
            return Err(EngineError::NotFound(format!("source {} not found", id)));
        }
        self.persist().await
    }

    async fn persist(&self) -> Result<(), EngineError> {
        let guard = self.entries.read().await;
        write_json_atomic(&self.path, &SourceRegistryFile { sources: guard.clone() })
    }
}

/// Matches a topic string against the source registry's tags, reusing
/// `research_index`'s tokenizer so queries tokenize identically everywhere.
/// Does not mutate the registry; returns up to `max_results` entries at or
/// above a minimum score, ties broken by registry insertion order.
pub fn match_sources<'a>(
    topic: &str,
    sources: &'a [SourceRegistryEntry],
    max_results: usize,
) -> Vec<&'a SourceRegistryEntry> {
    let topic_tokens: HashSet<String> = tokenize(topic).into_iter().collect();
    if topic_tokens.is_empty() {
        return Vec::new();
    }

    let mut scored: Vec<(usize, f64, &SourceRegistryEntry)> = sources
        .iter()
        .enumerate()
        .map(|(i, entry)| (i, score_source(entry, &topic_tokens), entry))
        .filter(|(_, score, _)| *score >= MIN_SCORE)
        .collect();

    // Stable sort descending by score; insertion index breaks ties since
    // equal-score entries keep their relative registry order.
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));

    scored.into_iter().take(max_results).map(|(_, _, entry)| entry).collect()
}

fn score_source(entry: &SourceRegistryEntry, topic_tokens: &HashSet<String>) -> f64 {
    let tag_tokens: HashSet<String> = entry.tags.iter().flat_map(|t| tokenize(t)).collect();
    let overlap = topic_tokens.intersection(&tag_tokens).count();
    overlap as f64
}

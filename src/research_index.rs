use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use crate::error::EngineError;
use crate::log_info;
use crate::store::write_json_atomic;
use crate::types::{Graph, IndexStats, NodeType, Project, ResearchIndexEntry, ResearchIndexFile};

const INDEX_FILE_NAME: &str = "research-index.json";
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "with", "that", "this", "from", "into", "have", "has",
    "was", "were", "been", "being", "about", "their", "which", "what", "when", "where",
    "how", "can", "will", "would", "could", "should", "not", "but", "its",
];
const MIN_TOKEN_LEN: usize = 3;
const TOP_N_LABELS: usize = 8;

/// Field weights applied during ranked search, per the note that topic
/// matches should outweigh tag matches, which in turn outweigh matches in
/// the derived search-terms bag.
const WEIGHT_TOPIC: f64 = 3.0;
const WEIGHT_TAGS: f64 = 2.0;
const WEIGHT_SEARCH_TERMS: f64 = 1.0;
const COVERAGE_BONUS_PER_TOKEN: f64 = 0.25;
const CUTOFF_FRACTION: f64 = 0.5;

/// Static synonym table expanding a unigram to the bag of tokens treated as
/// equivalent during search. Deliberately small and explicit so the
/// expansion stays reproducible and easy to extend.
fn synonym_table() -> &'static HashMap<&'static str, &'static [&'static str]> {
    static TABLE: std::sync::OnceLock<HashMap<&'static str, &'static [&'static str]>> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("water", ["water", "aqueous", "drinking"].as_slice()),
            ("plastic", ["plastic", "polymer", "microplastic", "microplastics"].as_slice()),
            ("cancer", ["cancer", "carcinogen", "carcinogenic", "tumor"].as_slice()),
            ("chemical", ["chemical", "compound", "substance"].as_slice()),
            ("food", ["food", "dietary", "nutrition"].as_slice()),
            ("air", ["air", "atmospheric", "inhaled"].as_slice()),
            ("safe", ["safe", "safety", "nontoxic"].as_slice()),
            ("risk", ["risk", "hazard", "danger"].as_slice()),
        ])
    })
}

/// Lowercases, strips non-alphanumeric characters, drops stop words and
/// tokens shorter than `MIN_TOKEN_LEN`, then appends adjacent bigrams of the
/// surviving unigrams.
pub fn tokenize(text: &str) -> Vec<String> {
    let unigrams: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() >= MIN_TOKEN_LEN && !STOP_WORDS.contains(&w.as_str()))
        .collect();

    let mut tokens = unigrams.clone();
    for pair in unigrams.windows(2) {
        tokens.push(format!("{}{}", pair[0], pair[1]));
    }
    tokens
}

/// Expands each unigram in `tokens` through the static synonym table,
/// returning the union as a deduplicated, deterministically ordered set.
pub fn expand_synonyms(tokens: &[String]) -> Vec<String> {
    let table = synonym_table();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in tokens {
        let expansions: &[&str] = table.get(token.as_str()).copied().unwrap_or(&[]);
        if seen.insert(token.clone()) {
            out.push(token.clone());
        }
        for expansion in expansions {
            if seen.insert(expansion.to_string()) {
                out.push(expansion.to_string());
            }
        }
    }
    out
}

fn node_type_tag(node_type: NodeType) -> &'static str {
    match node_type {
        NodeType::Domain => "domain",
        NodeType::Contaminant => "contaminant",
        NodeType::HealthEffect => "health-effect",
        NodeType::Solution => "solution",
        NodeType::Product => "product",
        NodeType::Recommendation => "recommendation",
        NodeType::Context => "context",
        NodeType::Investigation => "investigation",
    }
}

/// Derives the `tags` and `searchTerms` fields for a completed project's
/// graph: tags from the distinct node types present, search terms from the
/// tokenized topic plus the top labels/summaries by graph order.
fn derive_entry_fields(project: &Project, graph: &Graph) -> (Vec<String>, Vec<String>, IndexStats) {
    let mut tags: Vec<String> = graph
        .nodes
        .iter()
        .map(|n| node_type_tag(n.node_type).to_string())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    tags.sort();

    let mut search_terms: Vec<String> = tokenize(&project.topic);
    for node in graph.nodes.iter().take(TOP_N_LABELS) {
        search_terms.extend(tokenize(&node.label));
        if let Some(summary) = &node.summary {
            search_terms.extend(tokenize(summary));
        }
    }
    let mut seen = HashSet::new();
    search_terms.retain(|t| seen.insert(t.clone()));

    let citations = graph.edges.iter().map(|e| e.citations.len()).sum::<usize>()
        + graph.topics.values().map(|t| t.citations.len()).sum::<usize>();

    let stats = IndexStats {
        nodes: graph.nodes.len(),
        edges: graph.edges.len(),
        citations,
    };

    (tags, search_terms, stats)
}

/// Process-wide cross-project index. Writes are serialized by the internal
/// lock; reads take a snapshot under a read lock so concurrent `search`
/// calls never block each other.
pub struct ResearchIndex {
    path: PathBuf,
    entries: RwLock<HashMap<String, ResearchIndexEntry>>,
}

impl ResearchIndex {
    /// Reads the canonical index file at `data_root/research-index.json`.
    /// A missing file is treated as an empty index. Entries lacking
    /// `searchTerms` are dropped from the in-memory map and must be
    /// recovered through `rebuild`.
    pub async fn load(data_root: &Path) -> Result<Self, EngineError> {
        let path = data_root.join(INDEX_FILE_NAME);
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let file: ResearchIndexFile = serde_json::from_str(&contents)
                .map_err(|e| EngineError::InvalidInput(format!("invalid {}: {}", INDEX_FILE_NAME, e)))?;
            let mut map = HashMap::new();
            let mut needs_rebuild = 0usize;
            for entry in file.entries {
                if entry.search_terms.is_empty() {
                    needs_rebuild += 1;
                    continue;
                }
                map.insert(entry.project_id.clone(), entry);
            }
            if needs_rebuild > 0 {
                log_info!("[research_index] {} entries missing searchTerms, needs rebuild", needs_rebuild);
            }
            map
        } else {
            HashMap::new()
        };

        Ok(ResearchIndex {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Rebuilds the whole index from a set of completed `(project, graph)`
    /// pairs, discarding whatever was previously loaded, and persists it.
    pub async fn rebuild(&self, completed: &[(Project, Graph)]) -> Result<(), EngineError> {
        let mut map = HashMap::new();
        for (project, graph) in completed {
            let (tags, search_terms, stats) = derive_entry_fields(project, graph);
            map.insert(
                project.id.clone(),
                ResearchIndexEntry {
                    project_id: project.id.clone(),
                    topic: project.topic.clone(),
                    completed: project.updated.clone(),
                    stats,
                    tags,
                    search_terms,
                },
            );
        }
        {
            let mut guard = self.entries.write().await;
            *guard = map;
        }
        self.persist().await
    }

    /// Idempotent insert/replace keyed on `projectId`.
    pub async fn record(&self, project: &Project, graph: &Graph) -> Result<(), EngineError> {
        let (tags, search_terms, stats) = derive_entry_fields(project, graph);
        let entry = ResearchIndexEntry {
            project_id: project.id.clone(),
            topic: project.topic.clone(),
            completed: project.updated.clone(),
            stats,
            tags,
            search_terms,
        };
        {
            let mut guard = self.entries.write().await;
            guard.insert(entry.project_id.clone(), entry);
        }
        self.persist().await
    }

    async fn persist(&self) -> Result<(), EngineError> {
        let guard = self.entries.read().await;
        let mut entries: Vec<ResearchIndexEntry> = guard.values().cloned().collect();
        entries.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        write_json_atomic(&self.path, &ResearchIndexFile { entries })
    }

    /// Every entry, sorted by `projectId` (§6.2 `GetIndex`). Unlike `search`,
    /// this is not ranked or filtered by a query.
    pub async fn all(&self) -> Vec<ResearchIndexEntry> {
        let guard = self.entries.read().await;
        let mut entries: Vec<ResearchIndexEntry> = guard.values().cloned().collect();
        entries.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        entries
    }

    /// Ranked search per the weighted topic/tags/searchTerms scoring with a
    /// coverage bonus and a dynamic cutoff at 50% of the top score. Ties are
    /// broken by `projectId` so results are reproducible across runs
    /// regardless of map iteration order.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<ResearchIndexEntry> {
        let query_tokens = expand_synonyms(&tokenize(query));
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let query_set: HashSet<&str> = query_tokens.iter().map(|s| s.as_str()).collect();

        let guard = self.entries.read().await;
        let mut scored: Vec<(f64, &ResearchIndexEntry)> = guard
            .values()
            .map(|entry| (score_entry(entry, &query_set), entry))
            .filter(|(score, _)| *score > 0.0)
            .collect();

        if scored.is_empty() {
            return Vec::new();
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.project_id.cmp(&b.1.project_id))
        });

        let top_score = scored[0].0;
        let cutoff = top_score * CUTOFF_FRACTION;
        scored
            .into_iter()
            .filter(|(score, _)| *score >= cutoff)
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

fn score_entry(entry: &ResearchIndexEntry, query_set: &HashSet<&str>) -> f64 {
    let topic_tokens: HashSet<String> = tokenize(&entry.topic).into_iter().collect();
    let tag_tokens: HashSet<String> = entry.tags.iter().flat_map(|t| tokenize(t)).collect();
    let search_term_tokens: HashSet<String> = entry.search_terms.iter().cloned().collect();

    let mut matched = HashSet::new();
    let mut score = 0.0;

    for token in query_set {
        if topic_tokens.contains(*token) {
            score += WEIGHT_TOPIC;
            matched.insert(*token);
        }
        if tag_tokens.contains(*token) {
            score += WEIGHT_TAGS;
            matched.insert(*token);
        }
        if search_term_tokens.contains(*token) {
            score += WEIGHT_SEARCH_TERMS;
            matched.insert(*token);
        }
    }

    score += matched.len() as f64 * COVERAGE_BONUS_PER_TOKEN;
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfidenceDistribution, GraphMeta, ProjectConfig, ProjectStatus};
    use std::collections::HashMap as StdHashMap;
    use tempfile::tempdir;

    fn project(id: &str, topic: &str) -> Project {
        Project {
            id: id.to_string(),
            topic: topic.to_string(),
            status: ProjectStatus::Complete,
            created: "2026-01-01T00:00:00Z".to_string(),
            updated: "2026-01-02T00:00:00Z".to_string(),
            config: ProjectConfig::default(),
            last_error: None,
            artifacts: vec![],
            pre_pause_status: None,
        }
    }

    fn graph(project_id: &str, topic: &str, labels: Vec<(&str, NodeType)>) -> Graph {
        let nodes = labels
            .into_iter()
            .enumerate()
            .map(|(i, (label, node_type))| crate::graph::build_node(
                format!("n{}", i),
                label,
                node_type,
                crate::graph::NodeOpts::default(),
            ))
            .collect();
        Graph {
            meta: GraphMeta {
                topic: topic.to_string(),
                project_id: project_id.to_string(),
                created: "2026-01-01T00:00:00Z".to_string(),
                pipeline_version: "1.0.0".to_string(),
                node_count: 0,
                edge_count: 0,
                confidence_distribution: ConfidenceDistribution::default(),
            },
            nodes,
            edges: vec![],
            topics: StdHashMap::new(),
        }
    }

    #[test]
    fn tokenize_strips_stopwords_short_tokens_and_adds_bigrams() {
        let tokens = tokenize("Is the water safe for drinking?");
        assert!(!tokens.contains(&"the".to_string()));
        assert!(!tokens.contains(&"for".to_string()));
        assert!(tokens.contains(&"water".to_string()));
        assert!(tokens.contains(&"safe".to_string()));
        assert!(tokens.iter().any(|t| t == "watersafe" || t.len() > "water".len()));
    }

    #[test]
    fn expand_synonyms_is_deterministic() {
        let tokens = tokenize("plastic water");
        let a = expand_synonyms(&tokens);
        let b = expand_synonyms(&tokens);
        assert_eq!(a, b);
        assert!(a.contains(&"microplastic".to_string()) || a.contains(&"polymer".to_string()));
    }

    #[tokio::test]
    async fn record_then_search_finds_matching_project() {
        let dir = tempdir().unwrap();
        let index = ResearchIndex::load(dir.path()).await.unwrap();

        let p = project("p1", "microplastics in drinking water");
        let g = graph("p1", "microplastics", vec![("Microplastics", NodeType::Contaminant)]);
        index.record(&p, &g).await.unwrap();

        let results = index.search("drinking water safety", 10).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].project_id, "p1");
    }

    #[tokio::test]
    async fn record_is_idempotent_on_project_id() {
        let dir = tempdir().unwrap();
        let index = ResearchIndex::load(dir.path()).await.unwrap();

        let p = project("p1", "topic a");
        let g = graph("p1", "topic a", vec![]);
        index.record(&p, &g).await.unwrap();
        index.record(&p, &g).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join(INDEX_FILE_NAME)).unwrap();
        let file: ResearchIndexFile = serde_json::from_str(&contents).unwrap();
        assert_eq!(file.entries.len(), 1);
    }

    #[tokio::test]
    async fn all_lists_every_entry_sorted_by_project_id() {
        let dir = tempdir().unwrap();
        let index = ResearchIndex::load(dir.path()).await.unwrap();

        index.record(&project("p2", "topic b"), &graph("p2", "topic b", vec![])).await.unwrap();
        index.record(&project("p1", "topic a"), &graph("p1", "topic a", vec![])).await.unwrap();

        let entries = index.all().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].project_id, "p1");
        assert_eq!(entries[1].project_id, "p2");
    }

    #[tokio::test]
    async fn search_applies_dynamic_cutoff_and_limit() {
        let dir = tempdir().unwrap();
        let index = ResearchIndex::load(dir.path()).await.unwrap();

        let strong = project("strong", "water contamination risk");
        index
            .record(&strong, &graph("strong", "water", vec![("Water risk", NodeType::Contaminant)]))
            .await
            .unwrap();
        let unrelated = project("unrelated", "unrelated agricultural subsidy policy");
        index
            .record(&unrelated, &graph("unrelated", "subsidy", vec![]))
            .await
            .unwrap();

        let results = index.search("water contamination", 10).await;
        assert!(results.iter().any(|e| e.project_id == "strong"));
        assert!(!results.iter().any(|e| e.project_id == "unrelated"));
    }

    #[tokio::test]
    async fn search_with_no_matches_returns_empty() {
        let dir = tempdir().unwrap();
        let index = ResearchIndex::load(dir.path()).await.unwrap();
        index
            .record(&project("p1", "alpha"), &graph("p1", "alpha", vec![]))
            .await
            .unwrap();

        let results = index.search("zzz nonexistent qqq", 10).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn load_skips_entries_missing_search_terms() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE_NAME);
        std::fs::write(
            &path,
            serde_json::to_string(&ResearchIndexFile {
                entries: vec![ResearchIndexEntry {
                    project_id: "stale".to_string(),
                    topic: "stale topic".to_string(),
                    completed: "2026-01-01T00:00:00Z".to_string(),
                    stats: IndexStats::default(),
                    tags: vec![],
                    search_terms: vec![],
                }],
            })
            .unwrap(),
        )
        .unwrap();

        let index = ResearchIndex::load(dir.path()).await.unwrap();
        let results = index.search("stale topic", 10).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn rebuild_replaces_whole_index() {
        let dir = tempdir().unwrap();
        let index = ResearchIndex::load(dir.path()).await.unwrap();
        index
            .record(&project("old", "old topic"), &graph("old", "old topic", vec![]))
            .await
            .unwrap();

        let fresh = project("fresh", "fresh topic");
        let fresh_graph = graph("fresh", "fresh topic", vec![]);
        index.rebuild(&[(fresh, fresh_graph)]).await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join(INDEX_FILE_NAME)).unwrap();
        let file: ResearchIndexFile = serde_json::from_str(&contents).unwrap();
        assert_eq!(file.entries.len(), 1);
        assert_eq!(file.entries[0].project_id, "fresh");
    }
}

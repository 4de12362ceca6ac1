use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// --- Project ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Planning,
    Researching,
    Investigating,
    Adjudicating,
    Synthesizing,
    Complete,
    Paused,
    Error,
}

impl ProjectStatus {
    /// Forward phase progression only. `paused`/`error` are reachable from
    /// any non-terminal status and are handled separately by the pipeline
    /// driver, not by this predicate.
    pub fn is_valid_forward_transition(&self, to: &ProjectStatus) -> bool {
        use ProjectStatus::*;
        matches!(
            (self, to),
            (Pending, Planning)
                | (Planning, Researching)
                | (Researching, Investigating)
                | (Investigating, Adjudicating)
                | (Adjudicating, Synthesizing)
                | (Synthesizing, Complete)
        )
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Planning => "planning",
            ProjectStatus::Researching => "researching",
            ProjectStatus::Investigating => "investigating",
            ProjectStatus::Adjudicating => "adjudicating",
            ProjectStatus::Synthesizing => "synthesizing",
            ProjectStatus::Complete => "complete",
            ProjectStatus::Paused => "paused",
            ProjectStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

pub fn parse_project_status(s: &str) -> Result<ProjectStatus, String> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(ProjectStatus::Pending),
        "planning" => Ok(ProjectStatus::Planning),
        "researching" => Ok(ProjectStatus::Researching),
        "investigating" => Ok(ProjectStatus::Investigating),
        "adjudicating" => Ok(ProjectStatus::Adjudicating),
        "synthesizing" => Ok(ProjectStatus::Synthesizing),
        "complete" => Ok(ProjectStatus::Complete),
        "paused" => Ok(ProjectStatus::Paused),
        "error" => Ok(ProjectStatus::Error),
        _ => Err(format!("Invalid project status '{}'", s)),
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProjectConfig {
    #[serde(default = "default_investigation_budget")]
    pub investigation_budget: u32,
}

fn default_investigation_budget() -> u32 {
    10
}

impl Default for ProjectConfig {
    fn default() -> Self {
        ProjectConfig {
            investigation_budget: default_investigation_budget(),
        }
    }
}

impl ProjectConfig {
    /// `investigationBudget` must fall within `[0, 50]`.
    pub fn validate(&self) -> Result<(), String> {
        if self.investigation_budget > 50 {
            return Err(format!(
                "investigation_budget {} exceeds maximum of 50",
                self.investigation_budget
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Project {
    pub id: String,
    pub topic: String,
    pub status: ProjectStatus,
    pub created: String,
    pub updated: String,
    #[serde(default)]
    pub config: ProjectConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Status to restore on a bare `UnpauseProject` (no explicit phase),
    /// set by `pause` and consumed by `unpause_to_prior`. `None` once
    /// consumed, or for a project that has never been paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_pause_status: Option<ProjectStatus>,
}

impl Project {
    pub fn new(id: String, topic: String, config: ProjectConfig) -> Project {
        let now = Utc::now().to_rfc3339();
        Project {
            id,
            topic,
            status: ProjectStatus::Pending,
            created: now.clone(),
            updated: now,
            config,
            last_error: None,
            artifacts: Vec::new(),
            pre_pause_status: None,
        }
    }
}

// --- Plan ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct SubQuestion {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_evidence_types: Vec<EvidenceType>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Plan {
    pub sub_questions: Vec<SubQuestion>,
}

impl Plan {
    /// A plan decomposes a topic into 5-8 sub-questions with unique ids.
    pub fn validate(&self) -> Result<(), String> {
        if self.sub_questions.len() < 5 || self.sub_questions.len() > 8 {
            return Err(format!(
                "plan must have between 5 and 8 sub-questions, got {}",
                self.sub_questions.len()
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for q in &self.sub_questions {
            if !seen.insert(&q.id) {
                return Err(format!("duplicate sub-question id: {}", q.id));
            }
        }
        Ok(())
    }
}

// --- Evidence type / rating closed sets ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvidenceType {
    Sci,
    Gov,
    Org,
    Exp,
    Sta,
    Fin,
    Doc,
    Med,
    His,
    Tes,
    Tec,
}

impl std::fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvidenceType::Sci => "SCI",
            EvidenceType::Gov => "GOV",
            EvidenceType::Org => "ORG",
            EvidenceType::Exp => "EXP",
            EvidenceType::Sta => "STA",
            EvidenceType::Fin => "FIN",
            EvidenceType::Doc => "DOC",
            EvidenceType::Med => "MED",
            EvidenceType::His => "HIS",
            EvidenceType::Tes => "TES",
            EvidenceType::Tec => "TEC",
        };
        write!(f, "{}", s)
    }
}

/// Unknown evidence-type codes fall back to `MED`, matching the classify
/// phase's decision-tree default arm.
pub fn parse_evidence_type(s: &str) -> EvidenceType {
    match s.to_uppercase().as_str() {
        "SCI" => EvidenceType::Sci,
        "GOV" => EvidenceType::Gov,
        "ORG" => EvidenceType::Org,
        "EXP" => EvidenceType::Exp,
        "STA" => EvidenceType::Sta,
        "FIN" => EvidenceType::Fin,
        "DOC" => EvidenceType::Doc,
        "MED" => EvidenceType::Med,
        "HIS" => EvidenceType::His,
        "TES" => EvidenceType::Tes,
        "TEC" => EvidenceType::Tec,
        _ => EvidenceType::Med,
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceReliability {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl std::fmt::Display for SourceReliability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceReliability::A => "A",
            SourceReliability::B => "B",
            SourceReliability::C => "C",
            SourceReliability::D => "D",
            SourceReliability::E => "E",
            SourceReliability::F => "F",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct InformationCredibility(pub u8);

impl InformationCredibility {
    pub fn new(value: u8) -> Result<Self, String> {
        if (1..=6).contains(&value) {
            Ok(InformationCredibility(value))
        } else {
            Err(format!(
                "information credibility must be in 1..=6, got {}",
                value
            ))
        }
    }
}

// --- Citation ---
//
// Fixed structured schema (resolves the open question of whether a citation
// is a bare string or an object): a worker may still emit a bare string and
// it deserializes as `text` with the rest left unset.

#[derive(Serialize, Clone, Debug, PartialEq, Default)]
pub struct Citation {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
}

impl<'de> Deserialize<'de> for Citation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum CitationRaw {
            String(String),
            Struct {
                text: String,
                #[serde(default)]
                doi: Option<String>,
                #[serde(default)]
                pmid: Option<String>,
                #[serde(default)]
                url: Option<String>,
                #[serde(default)]
                year: Option<u32>,
            },
        }

        match CitationRaw::deserialize(deserializer)? {
            CitationRaw::String(text) => Ok(Citation {
                text,
                ..Default::default()
            }),
            CitationRaw::Struct {
                text,
                doi,
                pmid,
                url,
                year,
            } => Ok(Citation {
                text,
                doi,
                pmid,
                url,
                year,
            }),
        }
    }
}

// --- Evidence manifest ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EvidenceItem {
    pub evidence_id: String,
    pub sub_question_id: String,
    #[serde(rename = "type")]
    pub evidence_type: EvidenceType,
    pub description: String,
    pub citation: Citation,
    pub source_reliability: SourceReliability,
    pub information_credibility: InformationCredibility,
    pub triggered_pathway: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct EvidenceManifest {
    pub items: Vec<EvidenceItem>,
}

impl EvidenceManifest {
    /// Every item must reference a real sub-question and a registered pathway.
    pub fn validate(
        &self,
        plan: &Plan,
        known_pathways: &std::collections::HashSet<String>,
    ) -> Vec<String> {
        let sub_question_ids: std::collections::HashSet<&str> =
            plan.sub_questions.iter().map(|q| q.id.as_str()).collect();
        let mut errors = Vec::new();
        for item in &self.items {
            if !sub_question_ids.contains(item.sub_question_id.as_str()) {
                errors.push(format!(
                    "evidence {} references unknown sub-question {}",
                    item.evidence_id, item.sub_question_id
                ));
            }
            if !known_pathways.contains(&item.triggered_pathway) {
                errors.push(format!(
                    "evidence {} references unregistered pathway {}",
                    item.evidence_id, item.triggered_pathway
                ));
            }
        }
        errors
    }
}

// --- Pathway definitions ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerTemplate {
    Research,
    Review,
    Impl,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct TaskTemplate {
    pub purpose: String,
    pub key_tasks: Vec<String>,
    pub end_state: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BranchOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    In,
    Exists,
    NotExists,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BranchCondition {
    pub field: String,
    pub operator: BranchOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BranchTarget {
    NextDepth(u8),
    Terminate,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Branch {
    pub condition: BranchCondition,
    pub target: BranchTarget,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PathwayLevel {
    pub depth: u8,
    pub worker_template: WorkerTemplate,
    pub task: TaskTemplate,
    pub required_outputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExitCriteria {
    pub minimum_sources: u32,
    pub required_levels: u8,
    pub timeout_minutes: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PathwayTrigger {
    pub evidence_type: EvidenceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Pathway {
    pub id: String,
    pub name: String,
    pub version: String,
    pub trigger: PathwayTrigger,
    pub levels: Vec<PathwayLevel>,
    pub exit_criteria: ExitCriteria,
}

impl Pathway {
    /// `id` must match `P-[A-Z]{2,4}` and depth must not exceed 4 levels,
    /// numbered contiguously from 1.
    pub fn validate(&self) -> Result<(), String> {
        if !is_valid_pathway_id(&self.id) {
            return Err(format!("invalid pathway id: {}", self.id));
        }
        if self.levels.len() > 4 {
            return Err(format!(
                "pathway {} has {} levels, maximum is 4",
                self.id,
                self.levels.len()
            ));
        }
        for (idx, level) in self.levels.iter().enumerate() {
            let expected = (idx + 1) as u8;
            if level.depth != expected {
                return Err(format!(
                    "pathway {} level {} has depth {}, expected {}",
                    self.id, idx, level.depth, expected
                ));
            }
        }
        Ok(())
    }
}

pub fn is_valid_pathway_id(id: &str) -> bool {
    let Some(suffix) = id.strip_prefix("P-") else {
        return false;
    };
    (2..=4).contains(&suffix.len()) && suffix.chars().all(|c| c.is_ascii_uppercase())
}

// --- Pathway execution results ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct LevelOutput {
    pub depth: u8,
    pub evidence_found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_rating: Option<SourceReliability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_rating: Option<InformationCredibility>,
    #[serde(default)]
    pub findings: serde_json::Value,
    #[serde(default)]
    pub branch_signals: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_evidence_types: Vec<EvidenceType>,
    /// Set when the level timed out or the worker's output could not be
    /// parsed; the branch evaluator treats this as a dead end, not a retry.
    #[serde(default)]
    pub gap: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PathwayResult {
    pub pathway_id: String,
    pub evidence_id: String,
    pub levels: Vec<LevelOutput>,
}

// --- Adjudicated evidence ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    V,
    P,
    U,
    D,
    R,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Confidence::V => "verified",
            Confidence::P => "plausible",
            Confidence::U => "unverified",
            Confidence::D => "disputed",
            Confidence::R => "retracted",
        };
        write!(f, "{}", s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConsensusClaim {
    pub claim: String,
    pub consensus_level: f64,
    pub contrarian_analysis_triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrarian_result: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AdjudicatedItem {
    pub evidence_id: String,
    pub confidence: Confidence,
    pub confidence_rationale: String,
    pub pathway_results_ref: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct AdjudicatedEvidence {
    pub sub_question_id: String,
    pub items: Vec<AdjudicatedItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consensus_claims: Vec<ConsensusClaim>,
}

// --- Knowledge graph ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Domain,
    Contaminant,
    HealthEffect,
    Solution,
    Product,
    Recommendation,
    Context,
    Investigation,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeConfidence {
    Verified,
    Plausible,
    Unverified,
    Disputed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Node {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<NodeConfidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub key_stats: HashMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Causation,
    Evidence,
    Composition,
    Addresses,
    Gap,
    Contextualizes,
    Investigates,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub label: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct TopicEntry {
    pub title: String,
    pub sections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_sources: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ConfidenceDistribution {
    pub verified: u32,
    pub plausible: u32,
    pub unverified: u32,
    pub disputed: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GraphMeta {
    pub topic: String,
    pub project_id: String,
    pub created: String,
    pub pipeline_version: String,
    pub node_count: usize,
    pub edge_count: usize,
    #[serde(default)]
    pub confidence_distribution: ConfidenceDistribution,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Graph {
    pub meta: GraphMeta,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub topics: HashMap<String, TopicEntry>,
}

// --- Research index / source registry ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct IndexStats {
    pub nodes: usize,
    pub edges: usize,
    pub citations: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResearchIndexEntry {
    pub project_id: String,
    pub topic: String,
    pub completed: String,
    #[serde(default)]
    pub stats: IndexStats,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_terms: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ResearchIndexFile {
    #[serde(default)]
    pub entries: Vec<ResearchIndexEntry>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct SourceRegistryEntry {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub example_queries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct SourceRegistryFile {
    #[serde(default)]
    pub sources: Vec<SourceRegistryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn citation_accepts_bare_string() {
        let c: Citation = serde_json::from_str("\"some source\"").unwrap();
        assert_eq!(c.text, "some source");
        assert_eq!(c.doi, None);
    }

    #[test]
    fn citation_accepts_structured_object() {
        let c: Citation =
            serde_json::from_str(r#"{"text":"a paper","doi":"10.1/x","year":2020}"#).unwrap();
        assert_eq!(c.text, "a paper");
        assert_eq!(c.doi, Some("10.1/x".to_string()));
        assert_eq!(c.year, Some(2020));
    }

    #[test]
    fn pathway_id_validation() {
        assert!(is_valid_pathway_id("P-SCI"));
        assert!(is_valid_pathway_id("P-CON"));
        assert!(is_valid_pathway_id("P-AB"));
        assert!(!is_valid_pathway_id("P-A"));
        assert!(!is_valid_pathway_id("P-ABCDE"));
        assert!(!is_valid_pathway_id("SCI"));
        assert!(!is_valid_pathway_id("P-sci"));
    }

    #[test]
    fn project_config_rejects_oversized_budget() {
        let cfg = ProjectConfig {
            investigation_budget: 51,
        };
        assert!(cfg.validate().is_err());
        let cfg = ProjectConfig {
            investigation_budget: 50,
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn plan_requires_five_to_eight_unique_sub_questions() {
        let mut plan = Plan::default();
        for i in 0..5 {
            plan.sub_questions.push(SubQuestion {
                id: format!("q{}", i),
                text: "text".into(),
                expected_evidence_types: vec![],
            });
        }
        assert!(plan.validate().is_ok());

        plan.sub_questions.push(plan.sub_questions[0].clone());
        assert!(plan.validate().is_err());
    }

    #[test]
    fn unknown_evidence_type_defaults_to_med() {
        assert_eq!(parse_evidence_type("bogus"), EvidenceType::Med);
        assert_eq!(parse_evidence_type("sci"), EvidenceType::Sci);
    }

    #[test]
    fn project_status_forward_transitions() {
        assert!(ProjectStatus::Pending.is_valid_forward_transition(&ProjectStatus::Planning));
        assert!(!ProjectStatus::Pending.is_valid_forward_transition(&ProjectStatus::Complete));
    }
}

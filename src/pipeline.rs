use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event_bus::EventPublisher;
use crate::extractor;
use crate::graph::{self, citations_from_value};
use crate::investigation::{self, InvestigationTree};
use crate::pathway::PathwayRegistry;
use crate::research_index::ResearchIndex;
use crate::store::ProjectStore;
use crate::strategos::StrategosClient;
use crate::types::{
    AdjudicatedEvidence, AdjudicatedItem, ConfidenceDistribution, ConsensusClaim, Edge,
    EvidenceItem, EvidenceManifest, EvidenceType, Graph, GraphMeta, InformationCredibility, Node,
    NodeConfidence, NodeType, PathwayResult, Plan, Project, ProjectConfig, ProjectStatus,
    SourceReliability, SubQuestion, TopicEntry, WorkerTemplate,
};
use crate::{log_info, log_warn};

/// A phase of the state machine, ordered as the engine drives them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plan,
    Classify,
    Investigate,
    Adjudicate,
    Synthesize,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Plan,
        Phase::Classify,
        Phase::Investigate,
        Phase::Adjudicate,
        Phase::Synthesize,
    ];

    fn status(self) -> ProjectStatus {
        match self {
            Phase::Plan => ProjectStatus::Planning,
            Phase::Classify => ProjectStatus::Researching,
            Phase::Investigate => ProjectStatus::Investigating,
            Phase::Adjudicate => ProjectStatus::Adjudicating,
            Phase::Synthesize => ProjectStatus::Synthesizing,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Classify => "classify",
            Phase::Investigate => "investigate",
            Phase::Adjudicate => "adjudicate",
            Phase::Synthesize => "synthesize",
        }
    }

    fn index(self) -> usize {
        Phase::ALL.iter().position(|p| *p == self).unwrap_or(0)
    }
}

/// Parses a `fromPhase` string from `ResumeProject`, accepting
/// `research`/`researching` as a synonym for `classify` since that's the
/// status name a client observes on the wire.
pub fn parse_phase(s: &str) -> Result<Phase, String> {
    match s.to_lowercase().as_str() {
        "plan" | "planning" => Ok(Phase::Plan),
        "classify" | "research" | "researching" => Ok(Phase::Classify),
        "investigate" | "investigating" => Ok(Phase::Investigate),
        "adjudicate" | "adjudicating" => Ok(Phase::Adjudicate),
        "synthesize" | "synthesizing" => Ok(Phase::Synthesize),
        _ => Err(format!("unknown phase '{}'", s)),
    }
}

const PRIOR_RESEARCH_PROJECT_LIMIT: usize = 3;
const PRIOR_RESEARCH_NODE_LIMIT: usize = 5;
const INVESTIGATION_CONCURRENCY: usize = 8;

/// Matches `InvestigationTree::investigate`'s fixed depth budget; used to
/// bound the scan when reconstructing a pathway result from its per-level
/// artifacts.
const MAX_PATHWAY_DEPTH: u8 = 4;

/// Collaborator handles cloned out of the engine so a worker call can be
/// spawned onto a `JoinSet` as a fully owned, `'static` future.
#[derive(Clone)]
struct WorkerTaskHandles {
    client: Arc<dyn StrategosClient>,
    events: Arc<dyn EventPublisher>,
    data_root: PathBuf,
    timeout: std::time::Duration,
}

impl WorkerTaskHandles {
    fn project_path(&self, project_id: &str) -> PathBuf {
        self.data_root.join("projects").join(project_id)
    }

    /// Spawns a worker, waits for it, and returns its parsed JSON output.
    /// `Ok(None)` means the worker failed or its output didn't parse — never
    /// treated as fatal, always logged and handed back to the caller to
    /// decide what to do without data for this worker.
    async fn run_single_worker(
        &self,
        project_id: &str,
        template: WorkerTemplate,
        label: &str,
        task: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, EngineError> {
        let project_path = self.project_path(project_id);
        let worker_id = self.client.spawn(template, label, &project_path, None, task).await?;
        self.events
            .publish(project_id, "worker_spawned", json!({"workerId": worker_id, "label": label}))
            .await;

        let wait = self.client.wait_for_done(&worker_id, self.timeout, cancel).await?;
        self.events
            .publish(
                project_id,
                "worker_done",
                json!({"workerId": worker_id, "ok": wait.ok, "timedOut": wait.timed_out, "reason": wait.reason()}),
            )
            .await;

        if !wait.ok {
            if wait.timed_out {
                let _ = self.client.delete(&worker_id).await;
            }
            return Ok(None);
        }

        match extractor::extract(&wait.output.unwrap_or_default()) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                log_warn!("[pipeline] worker {} output failed to parse: {}", worker_id, e);
                Ok(None)
            }
        }
    }
}

/// Per-call state threaded explicitly through every phase function, so none
/// of them reach for global or implicit state: the project snapshot the
/// phase is running against and the cancellation token it must check at
/// every suspension point. The engine's shared collaborators (`events`,
/// `pathways`, `store`, `index`) stay on `PipelineEngine` itself rather than
/// being duplicated in here — they're already `Arc`s owned by one explicitly
/// constructed engine instance, not globals, so copying them per call would
/// only add clones without changing that property.
struct PipelineContext {
    project: Project,
    cancel: CancellationToken,
}

/// Result of running the contrarian pathway (`P-CON`) for a high-consensus
/// claim: a short description for the consensus claim's record, and
/// whether the counter-evidence itself cleared the credibility bar (source
/// rating A/B, info credibility <= 3) that triggers a confidence downgrade
/// on the sub-question's items.
struct ContrarianOutcome {
    description: String,
    credible: bool,
}

/// Drives projects through the plan/classify/investigate/adjudicate/
/// synthesize state machine. Holds no per-request state itself — every
/// method takes the project id explicitly and consults a per-project
/// cancellation token for pause/resume.
pub struct PipelineEngine {
    store: Arc<ProjectStore>,
    client: Arc<dyn StrategosClient>,
    events: Arc<dyn EventPublisher>,
    pathways: Arc<PathwayRegistry>,
    index: Arc<ResearchIndex>,
    investigation_tree: Arc<InvestigationTree>,
    config: EngineConfig,
    pause_tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<ProjectStore>,
        client: Arc<dyn StrategosClient>,
        events: Arc<dyn EventPublisher>,
        pathways: Arc<PathwayRegistry>,
        index: Arc<ResearchIndex>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let investigation_tree = InvestigationTree::new(pathways.clone(), client.clone(), events.clone());
        Arc::new(PipelineEngine {
            store,
            client,
            events,
            pathways,
            index,
            investigation_tree,
            config,
            pause_tokens: Mutex::new(HashMap::new()),
        })
    }

    fn project_path(&self, id: &str) -> PathBuf {
        self.config.data_root.join("projects").join(id)
    }

    fn handles(&self) -> WorkerTaskHandles {
        WorkerTaskHandles {
            client: self.client.clone(),
            events: self.events.clone(),
            data_root: self.config.data_root.clone(),
            timeout: self.config.default_worker_timeout(),
        }
    }

    async fn token_for(&self, id: &str) -> CancellationToken {
        let mut tokens = self.pause_tokens.lock().await;
        tokens.entry(id.to_string()).or_insert_with(CancellationToken::new).clone()
    }

    async fn reset_token(&self, id: &str) {
        self.pause_tokens.lock().await.insert(id.to_string(), CancellationToken::new());
    }

    async fn forget_token(&self, id: &str) {
        self.pause_tokens.lock().await.remove(id);
    }

    // --- control surface -------------------------------------------------

    pub async fn create_project(&self, topic: String, config: ProjectConfig) -> Result<Project, EngineError> {
        if topic.trim().is_empty() {
            return Err(EngineError::InvalidInput("topic must not be empty".into()));
        }
        config.validate().map_err(EngineError::InvalidInput)?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.store.create(&id, topic, config).await
    }

    pub async fn get_project(&self, id: &str) -> Result<Project, EngineError> {
        self.store.get(id).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, EngineError> {
        self.store.list().await
    }

    pub async fn delete_project(&self, id: &str) -> Result<(), EngineError> {
        self.forget_token(id).await;
        self.store.remove(id).await
    }

    pub async fn get_graph(&self, id: &str) -> Result<Graph, EngineError> {
        self.store.get_graph(id).await
    }

    /// Cancels every in-flight worker await for the project; the running
    /// `run_project`/`resume_project` task observes this at its next
    /// cooperative checkpoint and unwinds to `paused` without touching
    /// on-disk artifacts.
    pub async fn pause_project(&self, id: &str) -> Result<Project, EngineError> {
        let token = self.token_for(id).await;
        token.cancel();
        let filter = crate::strategos::WorkerFilter { project_id: Some(id.to_string()) };
        if let Ok(workers) = self.client.list_workers(Some(&filter)).await {
            for worker_id in workers {
                let _ = self.client.delete(&worker_id).await;
            }
        }
        self.store.pause(id).await
    }

    /// Resumes a paused project at `from_phase`; phases before it are not
    /// re-executed — their artifacts are read back from disk by whichever
    /// later phase needs them.
    pub async fn resume_project(&self, id: &str, from_phase: Phase) -> Result<(), EngineError> {
        self.reset_token(id).await;
        self.store.unpause(id, from_phase.status()).await?;
        self.run_from_phase(id, from_phase).await
    }

    /// Drives a brand-new project through the full state machine starting
    /// at `plan`.
    pub async fn run_project(&self, id: &str) -> Result<(), EngineError> {
        self.reset_token(id).await;
        self.run_from_phase(id, Phase::Plan).await
    }

    // --- state machine driver ---------------------------------------------

    async fn run_from_phase(&self, id: &str, from_phase: Phase) -> Result<(), EngineError> {
        for phase in Phase::ALL.iter().filter(|p| p.index() >= from_phase.index()) {
            match self.run_phase(id, *phase).await {
                Ok(()) => continue,
                Err(EngineError::Paused) => {
                    self.events
                        .publish(id, "phase", json!({"phase": phase.name(), "status": "paused"}))
                        .await;
                    return Ok(());
                }
                Err(e) => {
                    let message = e.to_string();
                    let _ = self.store.set_status(id, ProjectStatus::Error, Some(message.clone())).await;
                    self.events
                        .publish(id, "error_event", json!({"phase": phase.name(), "message": message}))
                        .await;
                    return Err(e);
                }
            }
        }

        self.store.set_status(id, ProjectStatus::Complete, None).await?;
        self.forget_token(id).await;
        self.events.publish(id, "phase", json!({"phase": "complete", "status": "done"})).await;
        Ok(())
    }

    async fn run_phase(&self, id: &str, phase: Phase) -> Result<(), EngineError> {
        let token = self.token_for(id).await;
        check_paused(&token)?;

        self.store.set_status(id, phase.status(), None).await?;
        self.events.publish(id, "phase", json!({"phase": phase.name(), "status": "running"})).await;

        let project = self.store.get(id).await?;
        let ctx = PipelineContext { project, cancel: token.clone() };
        let result = match phase {
            Phase::Plan => self.run_plan(&ctx).await,
            Phase::Classify => self.run_classify(&ctx).await,
            Phase::Investigate => self.run_investigate(&ctx).await,
            Phase::Adjudicate => self.run_adjudicate(&ctx).await,
            Phase::Synthesize => self.run_synthesize(&ctx).await,
        };

        if result.is_ok() {
            check_paused(&token)?;
        }
        result
    }

    // --- phase: plan -------------------------------------------------------

    async fn run_plan(&self, ctx: &PipelineContext) -> Result<(), EngineError> {
        let project = &ctx.project;
        let cancel = &ctx.cancel;
        let prior = self.prior_research_block(&project.topic).await;
        let task = format!(
            "Purpose: Decompose the research topic \"{}\" into 5-8 distinct, independently answerable sub-questions.\n\n\
             Key tasks:\n\
             - Identify the major facets of the topic that warrant separate investigation\n\
             - Assign each sub-question a short, unique id (e.g. q1, q2)\n\
             - Optionally note expected evidence types per sub-question\n\n\
             End state: Respond with a single JSON object: {{\"sub_questions\": [{{\"id\": ..., \"text\": ..., \"expected_evidence_types\": [...] }}]}}{}",
            project.topic, prior
        );

        let outcome = self.handles().run_single_worker(&project.id, WorkerTemplate::Research, "plan", &task, cancel).await?;
        let Some(value) = outcome else {
            return Err(EngineError::PermanentBackendFailure("plan worker did not produce usable output".into()));
        };

        let plan: Plan = serde_json::from_value(value)
            .map_err(|e| EngineError::OutputParseError(format!("plan output malformed: {}", e)))?;
        plan.validate().map_err(EngineError::InvalidInput)?;

        self.store.write_artifact(&project.id, "plan.json", serde_json::to_value(&plan).unwrap()).await
    }

    // --- phase: classify -----------------------------------------------------

    async fn run_classify(&self, ctx: &PipelineContext) -> Result<(), EngineError> {
        let project = &ctx.project;
        let cancel = &ctx.cancel;
        let plan = self.read_plan(&project.id).await?;
        let prior = self.prior_research_block(&project.topic).await;
        let pathway_catalog = self.pathway_catalog_blurb();

        let worker_count = classify_worker_count(plan.sub_questions.len());
        let batches = split_into_batches(&plan.sub_questions, worker_count);

        let mut joins: JoinSet<Result<Option<Value>, EngineError>> = JoinSet::new();
        for (batch_idx, batch) in batches.into_iter().enumerate() {
            let task = format!(
                "Purpose: Classify evidence types needed to answer these sub-questions of \"{}\".\n\n\
                 Key tasks:\n\
                 - For each sub-question, propose one or more evidence items\n\
                 - Evidence type must be one of: SCI, GOV, ORG, EXP, STA, FIN, DOC, MED, HIS, TES, TEC\n\
                 - Every evidence item's triggeredPathway must be one of the registered pathways:\n{}\n\n\
                 End state: Respond with a single JSON object: {{\"items\": [{{\"subQuestionId\":..., \"type\":..., \"description\":..., \"citation\":..., \"sourceReliability\":\"A\"-\"F\", \"informationCredibility\":1-6, \"triggeredPathway\":...}}]}}{}\n\n\
                 Sub-questions in this batch:\n{}",
                project.topic,
                pathway_catalog,
                prior,
                batch.iter().map(|q| format!("- {} ({})", q.id, q.text)).collect::<Vec<_>>().join("\n"),
            );
            let label = format!("classify-{}", batch_idx);
            let project_id = project.id.clone();
            let handles = self.handles();
            let cancel = cancel.clone();
            joins.spawn(async move { handles.run_single_worker(&project_id, WorkerTemplate::Research, &label, &task, &cancel).await });
        }

        let mut raw_items: Vec<Value> = Vec::new();
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok(Ok(Some(value))) => {
                    if let Some(items) = value.get("items").and_then(Value::as_array) {
                        raw_items.extend(items.clone());
                    }
                }
                Ok(Ok(None)) => log_warn!("[pipeline] a classify batch produced no usable output"),
                Ok(Err(e)) if e.is_paused() => return Err(e),
                Ok(Err(e)) => log_warn!("[pipeline] classify batch failed: {}", e),
                Err(e) => log_warn!("[pipeline] classify batch task panicked: {}", e),
            }
        }
        check_paused(cancel)?;

        let known_pathways = self.pathways.ids();
        let sub_question_ids: std::collections::HashSet<&str> = plan.sub_questions.iter().map(|q| q.id.as_str()).collect();

        let mut items = Vec::new();
        for (idx, raw) in raw_items.iter().enumerate() {
            match evidence_item_from_value(raw, idx, &sub_question_ids, &known_pathways) {
                Some(item) => items.push(item),
                None => log_warn!("[pipeline] dropping unclassifiable evidence item at index {}", idx),
            }
        }

        let manifest = EvidenceManifest { items };
        self.store
            .write_artifact(&project.id, "evidence/manifest-1.json", serde_json::to_value(&manifest).unwrap())
            .await
    }

    // --- phase: investigate --------------------------------------------------

    async fn run_investigate(&self, ctx: &PipelineContext) -> Result<(), EngineError> {
        let project = &ctx.project;
        let cancel = &ctx.cancel;
        let manifest = self.read_manifest(&project.id, 1).await?;
        let budget = project.config.investigation_budget as usize;

        let mut queue: VecDeque<EvidenceItem> = manifest.items.into_iter().take(budget).collect();
        let mut dispatched = queue.len();
        let mut spawned_items: Vec<EvidenceItem> = Vec::new();
        let mut in_flight = 0usize;

        type InvestigateJoin = Result<(EvidenceItem, investigation::InvestigationOutcome), EngineError>;
        let mut joins: JoinSet<InvestigateJoin> = JoinSet::new();

        loop {
            while in_flight < INVESTIGATION_CONCURRENCY {
                let Some(item) = queue.pop_front() else { break };
                let tree = self.investigation_tree.clone();
                let project_id = project.id.clone();
                let project_path = self.project_path(&project.id);
                let timeout = self.config.default_worker_timeout();
                let cancel_clone = cancel.clone();
                let item_clone = item.clone();
                joins.spawn(async move {
                    let outcome = tree.investigate(&project_id, &project_path, &item_clone, timeout, &cancel_clone).await?;
                    Ok((item_clone, outcome))
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let Some(joined) = joins.join_next().await else { break };
            in_flight -= 1;

            let (item, outcome) = match joined {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) if e.is_paused() => return Err(e),
                Ok(Err(e)) => {
                    log_warn!("[pipeline] investigation of an evidence item failed: {}", e);
                    continue;
                }
                Err(e) => {
                    log_warn!("[pipeline] investigation task panicked: {}", e);
                    continue;
                }
            };

            self.write_pathway_result_artifacts(&project.id, &outcome.result).await?;

            for evidence_type in &outcome.spawn_requests {
                if dispatched >= budget {
                    log_warn!("[pipeline] investigation budget exhausted, dropping cross-pathway spawn request");
                    break;
                }
                let Some(pathway_id) = self.pathway_for_type(*evidence_type) else {
                    continue;
                };
                let synthetic = EvidenceItem {
                    evidence_id: format!("{}-spawn-{}", item.evidence_id, dispatched),
                    sub_question_id: item.sub_question_id.clone(),
                    evidence_type: *evidence_type,
                    description: format!("Cross-pathway follow-up from {}", item.evidence_id),
                    citation: item.citation.clone(),
                    source_reliability: item.source_reliability,
                    information_credibility: item.information_credibility,
                    triggered_pathway: pathway_id,
                };
                dispatched += 1;
                queue.push_back(synthetic.clone());
                spawned_items.push(synthetic);
            }
        }

        check_paused(cancel)?;

        if !spawned_items.is_empty() {
            let supplement = EvidenceManifest { items: spawned_items };
            self.store
                .write_artifact(&project.id, "evidence/manifest-2.json", serde_json::to_value(&supplement).unwrap())
                .await?;
        }

        Ok(())
    }

    fn pathway_for_type(&self, evidence_type: EvidenceType) -> Option<String> {
        let mut ids: Vec<String> = self.pathways.ids().into_iter().collect();
        ids.sort();
        ids.into_iter().find(|id| {
            self.pathways
                .get(id)
                .map(|p| p.trigger.evidence_type == evidence_type)
                .unwrap_or(false)
        })
    }

    // --- phase: adjudicate ---------------------------------------------------

    async fn run_adjudicate(&self, ctx: &PipelineContext) -> Result<(), EngineError> {
        let project = &ctx.project;
        let cancel = &ctx.cancel;
        let plan = self.read_plan(&project.id).await?;
        let mut manifest = self.read_manifest(&project.id, 1).await?;
        if let Ok(supplement) = self.read_manifest(&project.id, 2).await {
            manifest.items.extend(supplement.items);
        }

        type PendingItem = (String, String, investigation::ConfidenceFactors);
        type AdjudicateJoin = (String, Vec<PendingItem>, Result<Option<Value>, EngineError>);
        let mut joins: JoinSet<AdjudicateJoin> = JoinSet::new();

        for sub_question in &plan.sub_questions {
            let items: Vec<&EvidenceItem> = manifest.items.iter().filter(|i| i.sub_question_id == sub_question.id).collect();
            if items.is_empty() {
                continue;
            }

            let mut pending: Vec<PendingItem> = Vec::new();
            for item in &items {
                let pathway_result = self.read_pathway_result(&project.id, &item.triggered_pathway, &item.evidence_id).await;
                let results: Vec<PathwayResult> = pathway_result.into_iter().collect();
                let factors = investigation::derive_confidence_factors(&results);
                pending.push((item.evidence_id.clone(), item.triggered_pathway.clone(), factors));
            }

            let preview: Vec<String> = pending
                .iter()
                .map(|(evidence_id, _, factors)| format!("{}={:?}", evidence_id, investigation::compute_confidence(factors)))
                .collect();
            let task = format!(
                "Purpose: Assess consensus across the adjudicated evidence for sub-question \"{}\".\n\n\
                 Key tasks:\n\
                 - Identify claims multiple evidence items converge on\n\
                 - For each claim, estimate a consensus level in [0,1]\n\n\
                 End state: Respond with a single JSON object: {{\"consensus_claims\": [{{\"claim\":..., \"consensus_level\":0.0}}]}}\n\n\
                 Evidence confidences: {}",
                preview.join(", "),
            );

            let sub_question_id = sub_question.id.clone();
            let label = format!("adjudicate-{}", sub_question_id);
            let project_id = project.id.clone();
            let handles = self.handles();
            let cancel_clone = cancel.clone();
            joins.spawn(async move {
                let value = handles.run_single_worker(&project_id, WorkerTemplate::Review, &label, &task, &cancel_clone).await;
                (sub_question_id, pending, value)
            });
        }

        let mut per_sub_question = Vec::new();
        while let Some(joined) = joins.join_next().await {
            let (sub_question_id, pending, value) =
                joined.map_err(|e| EngineError::InvariantViolation(format!("adjudicate task panicked: {}", e)))?;
            match value {
                Ok(v) => per_sub_question.push((sub_question_id, pending, v)),
                Err(e) if e.is_paused() => return Err(e),
                Err(e) => {
                    log_warn!("[pipeline] adjudicate worker for {} failed: {}", sub_question_id, e);
                    per_sub_question.push((sub_question_id, pending, None));
                }
            }
        }
        check_paused(cancel)?;

        for (sub_question_id, mut pending, worker_value) in per_sub_question {
            let mut consensus_claims = parse_consensus_claims(worker_value.as_ref());

            let mut credible_contrarian_found = false;
            for claim in consensus_claims.iter_mut() {
                if claim.consensus_level > 0.80 && !claim.contrarian_analysis_triggered {
                    let contrarian = self.run_contrarian(project, &sub_question_id, cancel).await?;
                    claim.contrarian_analysis_triggered = true;
                    claim.contrarian_result = Some(contrarian.description);
                    credible_contrarian_found |= contrarian.credible;
                }
            }

            // A credible contrarian result downgrades every evidence item
            // under this sub-question by one confidence level (§9): it
            // rebuts the consensus the items were scored against, not any
            // one item's own pathway findings.
            let items: Vec<AdjudicatedItem> = pending
                .drain(..)
                .map(|(evidence_id, pathway_id, mut factors)| {
                    if credible_contrarian_found {
                        factors.credible_contrarian = true;
                    }
                    let confidence = investigation::compute_confidence(&factors);
                    AdjudicatedItem {
                        evidence_id: evidence_id.clone(),
                        confidence,
                        confidence_rationale: rationale_for(&factors, confidence),
                        pathway_results_ref: format!("investigation/{}-{}", pathway_id, evidence_id),
                        flags: flags_for(&factors),
                    }
                })
                .collect();

            let adjudicated = AdjudicatedEvidence { sub_question_id: sub_question_id.clone(), items, consensus_claims };
            self.store
                .write_artifact(
                    &project.id,
                    &format!("adjudication/{}-adjudicated.json", sub_question_id),
                    serde_json::to_value(&adjudicated).unwrap(),
                )
                .await?;
        }

        Ok(())
    }

    /// Spawns the contrarian pathway for a sub-question whose consensus
    /// exceeded the 80% threshold.
    async fn run_contrarian(&self, project: &Project, sub_question_id: &str, cancel: &CancellationToken) -> Result<ContrarianOutcome, EngineError> {
        if self.pathways.get("P-CON").is_err() {
            return Ok(ContrarianOutcome { description: "contrarian pathway not registered".to_string(), credible: false });
        }
        let synthetic = EvidenceItem {
            evidence_id: format!("{}-contrarian", sub_question_id),
            sub_question_id: sub_question_id.to_string(),
            evidence_type: EvidenceType::Sci,
            description: format!("Strongest counter-argument for sub-question {}", sub_question_id),
            citation: crate::types::Citation::default(),
            source_reliability: SourceReliability::C,
            information_credibility: InformationCredibility::new(4).unwrap(),
            triggered_pathway: "P-CON".to_string(),
        };

        let outcome = self
            .investigation_tree
            .investigate(&project.id, &self.project_path(&project.id), &synthetic, self.config.default_worker_timeout(), cancel)
            .await?;

        self.write_pathway_result_artifacts(&project.id, &outcome.result).await?;

        let credible = outcome.result.levels.iter().any(|level| {
            !level.gap
                && level.evidence_found
                && matches!(level.source_rating, Some(SourceReliability::A) | Some(SourceReliability::B))
                && level.info_rating.map(|r| r.0 <= 3).unwrap_or(false)
        });

        let description = if credible {
            "contrarian pathway found a credible counter-argument".to_string()
        } else {
            "no credible counter found".to_string()
        };
        Ok(ContrarianOutcome { description, credible })
    }

    // --- phase: synthesize ---------------------------------------------------

    async fn run_synthesize(&self, ctx: &PipelineContext) -> Result<(), EngineError> {
        let project = &ctx.project;
        let cancel = &ctx.cancel;
        let prior = self.prior_research_block(&project.topic).await;
        let adjudicated = self.read_all_adjudications(&project.id).await?;

        let mut task = format!(
            "Purpose: Synthesize a typed knowledge graph for \"{}\" from the adjudicated evidence.\n\n\
             Key tasks:\n\
             - Produce nodes of type domain, contaminant, health-effect, solution, product, recommendation, context, or investigation\n\
             - Produce edges of type causation, evidence, composition, addresses, gap, contextualizes, or investigates\n\
             - Every non-domain node must have an entry in topics keyed by its node id, with at least one non-empty section\n\n\
             End state: Respond with a single JSON object: {{\"nodes\":[...], \"edges\":[...], \"topics\": {{}}}}{}\n\n\
             Adjudicated confidence summary: {}",
            project.topic,
            prior,
            adjudicated.iter().flat_map(|a| a.items.iter().map(|i| format!("{}={}", i.evidence_id, i.confidence))).collect::<Vec<_>>().join(", "),
        );

        for attempt in 0..2 {
            let label = if attempt == 0 { "synthesize".to_string() } else { "synthesize-retry".to_string() };
            let outcome = self.handles().run_single_worker(&project.id, WorkerTemplate::Impl, &label, &task, cancel).await?;
            let Some(value) = outcome else {
                return Err(EngineError::PermanentBackendFailure("synthesis worker did not produce usable output".into()));
            };

            let graph = match build_graph_from_value(project, &value) {
                Ok(g) => g,
                Err(e) if attempt == 0 => {
                    task = format!("{}\n\nYour previous response was malformed: {}. Respond with valid JSON only.", task, e);
                    continue;
                }
                Err(e) => return Err(EngineError::SchemaViolation(vec![e])),
            };

            let (errors, warnings) = graph::validate(&graph);
            for warning in &warnings {
                log_warn!("[pipeline] graph validation warning: {}", warning);
            }
            if errors.is_empty() {
                self.store.write_artifact(&project.id, "graph.json", serde_json::to_value(&graph).unwrap()).await?;
                self.index.record(project, &graph).await?;
                self.events.publish(&project.id, "graph_validated", json!({"errors": Vec::<String>::new(), "warnings": warnings})).await;
                log_info!("[pipeline] project {} synthesized {} nodes, {} edges", project.id, graph.nodes.len(), graph.edges.len());
                return Ok(());
            }
            if attempt == 0 {
                log_warn!("[pipeline] graph failed validation, retrying synthesis once: {:?}", errors);
                task = format!("{}\n\nFix these issues:\n{}", task, errors.join("\n"));
                continue;
            }
            self.events.publish(&project.id, "graph_validated", json!({"errors": errors})).await;
            return Err(EngineError::SchemaViolation(errors));
        }

        Err(EngineError::InvariantViolation("synthesis retry loop exited without a result".into()))
    }

    // --- shared helpers -----------------------------------------------------

    async fn prior_research_block(&self, topic: &str) -> String {
        let entries = self.index.search(topic, PRIOR_RESEARCH_PROJECT_LIMIT).await;
        if entries.is_empty() {
            return String::new();
        }
        let mut lines = vec!["\n\nPRIOR RESEARCH:".to_string()];
        for entry in &entries {
            let Ok(graph) = self.store.get_graph(&entry.project_id).await else {
                continue;
            };
            let relevant: Vec<&Node> = graph
                .nodes
                .iter()
                .filter(|n| matches!(n.node_type, NodeType::Recommendation | NodeType::Product | NodeType::Solution))
                .take(PRIOR_RESEARCH_NODE_LIMIT)
                .collect();
            if relevant.is_empty() {
                continue;
            }
            lines.push(format!("From project {} (\"{}\"):", entry.project_id, entry.topic));
            for node in relevant {
                let summary = node.summary.clone().unwrap_or_default();
                lines.push(format!("- [{:?}] {}: {}", node.node_type, node.label, summary));
            }
        }
        if lines.len() == 1 {
            return String::new();
        }
        lines.join("\n")
    }

    fn pathway_catalog_blurb(&self) -> String {
        let mut ids: Vec<String> = self.pathways.ids().into_iter().collect();
        ids.sort();
        ids.iter()
            .filter_map(|id| self.pathways.get(id).ok())
            .map(|p| format!("- {} ({:?})", p.id, p.trigger.evidence_type))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn read_plan(&self, project_id: &str) -> Result<Plan, EngineError> {
        let value = self.store.read_artifact(project_id, "plan.json").await?;
        serde_json::from_value(value).map_err(|e| EngineError::InvariantViolation(format!("corrupt plan.json: {}", e)))
    }

    async fn read_manifest(&self, project_id: &str, n: u32) -> Result<EvidenceManifest, EngineError> {
        let value = self.store.read_artifact(project_id, &format!("evidence/manifest-{}.json", n)).await?;
        serde_json::from_value(value).map_err(|e| EngineError::InvariantViolation(format!("corrupt manifest-{}.json: {}", n, e)))
    }

    /// Writes one artifact per pathway level (§6.1: `investigation/<pathwayId>-<evidenceId>-L<depth>.json`)
    /// rather than a single collapsed file, so the on-disk layout matches
    /// the engine's `(pathwayId, evidenceId, levelDepth)` result key.
    async fn write_pathway_result_artifacts(&self, project_id: &str, result: &PathwayResult) -> Result<(), EngineError> {
        for level in &result.levels {
            self.store
                .write_artifact(
                    project_id,
                    &format!("investigation/{}-{}-L{}.json", result.pathway_id, result.evidence_id, level.depth),
                    serde_json::to_value(level).unwrap(),
                )
                .await?;
        }
        Ok(())
    }

    /// Reconstructs a `PathwayResult` by scanning the per-level artifacts
    /// `investigation/<pathwayId>-<evidenceId>-L<depth>.json` for depths
    /// `1..=MAX_PATHWAY_DEPTH`. Missing depths (never reached, or a gap that
    /// terminated the branch before they were spawned) are simply absent.
    async fn read_pathway_result(&self, project_id: &str, pathway_id: &str, evidence_id: &str) -> Option<PathwayResult> {
        let mut levels = Vec::new();
        for depth in 1..=MAX_PATHWAY_DEPTH {
            let path = format!("investigation/{}-{}-L{}.json", pathway_id, evidence_id, depth);
            if let Ok(value) = self.store.read_artifact(project_id, &path).await {
                if let Ok(level) = serde_json::from_value(value) {
                    levels.push(level);
                }
            }
        }
        if levels.is_empty() {
            return None;
        }
        Some(PathwayResult { pathway_id: pathway_id.to_string(), evidence_id: evidence_id.to_string(), levels })
    }

    async fn read_all_adjudications(&self, project_id: &str) -> Result<Vec<AdjudicatedEvidence>, EngineError> {
        let plan = self.read_plan(project_id).await?;
        let mut out = Vec::new();
        for sub_question in &plan.sub_questions {
            let path = format!("adjudication/{}-adjudicated.json", sub_question.id);
            if let Ok(value) = self.store.read_artifact(project_id, &path).await {
                if let Ok(adjudicated) = serde_json::from_value(value) {
                    out.push(adjudicated);
                }
            }
        }
        Ok(out)
    }
}

fn check_paused(token: &CancellationToken) -> Result<(), EngineError> {
    if token.is_cancelled() {
        Err(EngineError::Paused)
    } else {
        Ok(())
    }
}

fn classify_worker_count(sub_question_count: usize) -> usize {
    ((sub_question_count + 1) / 2).clamp(3, 5)
}

fn split_into_batches<'a>(sub_questions: &'a [SubQuestion], worker_count: usize) -> Vec<Vec<&'a SubQuestion>> {
    let mut batches: Vec<Vec<&SubQuestion>> = vec![Vec::new(); worker_count.max(1)];
    for (i, q) in sub_questions.iter().enumerate() {
        batches[i % batches.len()].push(q);
    }
    batches.into_iter().filter(|b| !b.is_empty()).collect()
}

fn evidence_item_from_value(
    value: &Value,
    index: usize,
    known_sub_questions: &std::collections::HashSet<&str>,
    known_pathways: &std::collections::HashSet<String>,
) -> Option<EvidenceItem> {
    let sub_question_id = value.get("subQuestionId").or_else(|| value.get("sub_question_id")).and_then(Value::as_str)?;
    if !known_sub_questions.contains(sub_question_id) {
        return None;
    }
    let triggered_pathway = value.get("triggeredPathway").or_else(|| value.get("triggered_pathway")).and_then(Value::as_str)?;
    if !known_pathways.contains(triggered_pathway) {
        return None;
    }
    let description = value.get("description").and_then(Value::as_str).unwrap_or("").to_string();
    let evidence_type = value.get("type").and_then(Value::as_str).map(crate::types::parse_evidence_type).unwrap_or(EvidenceType::Med);
    let citation = value.get("citation").map(citations_from_value).unwrap_or_default().into_iter().next().unwrap_or_default();
    let source_reliability = value
        .get("sourceReliability")
        .or_else(|| value.get("source_reliability"))
        .and_then(Value::as_str)
        .and_then(parse_source_reliability)
        .unwrap_or(SourceReliability::F);
    let information_credibility = value
        .get("informationCredibility")
        .or_else(|| value.get("information_credibility"))
        .and_then(Value::as_u64)
        .and_then(|n| InformationCredibility::new(n.clamp(1, 6) as u8).ok())
        .unwrap_or_else(|| InformationCredibility::new(6).unwrap());
    let evidence_id = value
        .get("evidenceId")
        .or_else(|| value.get("evidence_id"))
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("EV-{}", index));

    Some(EvidenceItem {
        evidence_id,
        sub_question_id: sub_question_id.to_string(),
        evidence_type,
        description,
        citation,
        source_reliability,
        information_credibility,
        triggered_pathway: triggered_pathway.to_string(),
    })
}

fn parse_source_reliability(s: &str) -> Option<SourceReliability> {
    match s.to_uppercase().as_str() {
        "A" => Some(SourceReliability::A),
        "B" => Some(SourceReliability::B),
        "C" => Some(SourceReliability::C),
        "D" => Some(SourceReliability::D),
        "E" => Some(SourceReliability::E),
        "F" => Some(SourceReliability::F),
        _ => None,
    }
}

fn rationale_for(factors: &investigation::ConfidenceFactors, confidence: crate::types::Confidence) -> String {
    format!(
        "{:?} from {} A/B confirmation(s) and {} lower-tier confirmation(s){}",
        confidence,
        factors.ab_confirmations,
        factors.c_or_lower_confirmations,
        if factors.credible_contrarian { "; credible contrarian downgraded this rating" } else { "" }
    )
}

fn flags_for(factors: &investigation::ConfidenceFactors) -> Vec<String> {
    let mut flags = Vec::new();
    if factors.unresolved_bias_flag {
        flags.push("unresolved_bias".to_string());
    }
    if factors.industry_funded_without_replication {
        flags.push("industry_funded_without_replication".to_string());
    }
    if factors.testimonial_only {
        flags.push("testimonial_only".to_string());
    }
    if factors.preclinical_only {
        flags.push("preclinical_only".to_string());
    }
    if factors.small_sample_size {
        flags.push("small_sample_size".to_string());
    }
    if factors.p_hacking_or_cherry_picking {
        flags.push("p_hacking_or_cherry_picking".to_string());
    }
    flags
}

fn parse_consensus_claims(value: Option<&Value>) -> Vec<ConsensusClaim> {
    let Some(value) = value else {
        return Vec::new();
    };
    let Some(items) = value.get("consensus_claims").and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let claim = item.get("claim").and_then(Value::as_str)?.to_string();
            let consensus_level = item.get("consensus_level").and_then(Value::as_f64).unwrap_or(0.0);
            Some(ConsensusClaim { claim, consensus_level, contrarian_analysis_triggered: false, contrarian_result: None })
        })
        .collect()
}

fn build_graph_from_value(project: &Project, value: &Value) -> Result<Graph, String> {
    let nodes: Vec<Node> = value
        .get("nodes")
        .cloned()
        .map(|v| serde_json::from_value(v).map_err(|e| format!("nodes malformed: {}", e)))
        .transpose()?
        .unwrap_or_default();
    let edges: Vec<Edge> = value
        .get("edges")
        .cloned()
        .map(|v| serde_json::from_value(v).map_err(|e| format!("edges malformed: {}", e)))
        .transpose()?
        .unwrap_or_default();
    let topics: HashMap<String, TopicEntry> = value
        .get("topics")
        .cloned()
        .map(|v| serde_json::from_value(v).map_err(|e| format!("topics malformed: {}", e)))
        .transpose()?
        .unwrap_or_default();

    let mut distribution = ConfidenceDistribution::default();
    for node in &nodes {
        match node.confidence {
            Some(NodeConfidence::Verified) => distribution.verified += 1,
            Some(NodeConfidence::Plausible) => distribution.plausible += 1,
            Some(NodeConfidence::Unverified) => distribution.unverified += 1,
            Some(NodeConfidence::Disputed) => distribution.disputed += 1,
            None => {}
        }
    }

    Ok(Graph {
        meta: GraphMeta {
            topic: project.topic.clone(),
            project_id: project.id.clone(),
            created: chrono::Utc::now().to_rfc3339(),
            pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
            node_count: nodes.len(),
            edge_count: edges.len(),
            confidence_distribution: distribution,
        },
        nodes,
        edges,
        topics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_parsing_accepts_status_synonyms() {
        assert_eq!(parse_phase("research").unwrap(), Phase::Classify);
        assert_eq!(parse_phase("researching").unwrap(), Phase::Classify);
        assert_eq!(parse_phase("SYNTHESIZE").unwrap(), Phase::Synthesize);
        assert!(parse_phase("bogus").is_err());
    }

    #[test]
    fn phase_ordering_is_stable() {
        assert!(Phase::Plan.index() < Phase::Classify.index());
        assert!(Phase::Classify.index() < Phase::Investigate.index());
        assert!(Phase::Investigate.index() < Phase::Adjudicate.index());
        assert!(Phase::Adjudicate.index() < Phase::Synthesize.index());
    }

    #[test]
    fn classify_worker_count_is_clamped() {
        assert_eq!(classify_worker_count(5), 3);
        assert_eq!(classify_worker_count(8), 4);
        assert_eq!(classify_worker_count(20), 5);
    }

    #[test]
    fn split_into_batches_distributes_round_robin() {
        let questions: Vec<SubQuestion> = (0..5)
            .map(|i| SubQuestion { id: format!("q{}", i), text: String::new(), expected_evidence_types: vec![] })
            .collect();
        let batches = split_into_batches(&questions, 3);
        assert_eq!(batches.len(), 3);
        let total: usize = batches.iter().map(|b| b.len()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn evidence_item_from_value_drops_unknown_sub_question() {
        let known_sub_questions: std::collections::HashSet<&str> = ["q1"].into_iter().collect();
        let known_pathways: std::collections::HashSet<String> = ["P-SCI".to_string()].into_iter().collect();
        let value = json!({"subQuestionId": "q-missing", "triggeredPathway": "P-SCI", "type": "SCI"});
        assert!(evidence_item_from_value(&value, 0, &known_sub_questions, &known_pathways).is_none());
    }

    #[test]
    fn evidence_item_from_value_drops_unregistered_pathway() {
        let known_sub_questions: std::collections::HashSet<&str> = ["q1"].into_iter().collect();
        let known_pathways: std::collections::HashSet<String> = ["P-SCI".to_string()].into_iter().collect();
        let value = json!({"subQuestionId": "q1", "triggeredPathway": "P-GHOST", "type": "SCI"});
        assert!(evidence_item_from_value(&value, 0, &known_sub_questions, &known_pathways).is_none());
    }

    #[test]
    fn evidence_item_from_value_accepts_valid_item() {
        let known_sub_questions: std::collections::HashSet<&str> = ["q1"].into_iter().collect();
        let known_pathways: std::collections::HashSet<String> = ["P-SCI".to_string()].into_iter().collect();
        let value = json!({
            "subQuestionId": "q1",
            "triggeredPathway": "P-SCI",
            "type": "SCI",
            "description": "desc",
            "citation": "a paper",
            "sourceReliability": "B",
            "informationCredibility": 3,
        });
        let item = evidence_item_from_value(&value, 0, &known_sub_questions, &known_pathways).unwrap();
        assert_eq!(item.sub_question_id, "q1");
        assert_eq!(item.triggered_pathway, "P-SCI");
        assert_eq!(item.source_reliability, SourceReliability::B);
        assert_eq!(item.information_credibility.0, 3);
        assert_eq!(item.citation.text, "a paper");
    }

    #[test]
    fn consensus_claims_parse_from_worker_value() {
        let value = json!({"consensus_claims": [{"claim": "x causes y", "consensus_level": 0.9}]});
        let claims = parse_consensus_claims(Some(&value));
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].consensus_level, 0.9);
        assert!(!claims[0].contrarian_analysis_triggered);
    }

    #[test]
    fn consensus_claims_missing_field_is_empty() {
        assert!(parse_consensus_claims(None).is_empty());
        assert!(parse_consensus_claims(Some(&json!({}))).is_empty());
    }

    #[test]
    fn build_graph_from_value_counts_confidence_distribution() {
        let project = Project::new("p1".to_string(), "microplastics".to_string(), ProjectConfig::default());
        let value = json!({
            "nodes": [
                {"id": "n1", "label": "a", "type": "contaminant", "confidence": "verified"},
                {"id": "n2", "label": "b", "type": "contaminant", "confidence": "plausible"},
            ],
            "edges": [],
            "topics": {},
        });
        let graph = build_graph_from_value(&project, &value).unwrap();
        assert_eq!(graph.meta.node_count, 2);
        assert_eq!(graph.meta.confidence_distribution.verified, 1);
        assert_eq!(graph.meta.confidence_distribution.plausible, 1);
    }

    #[test]
    fn build_graph_from_value_rejects_malformed_nodes() {
        let project = Project::new("p1".to_string(), "microplastics".to_string(), ProjectConfig::default());
        let value = json!({"nodes": [{"id": "n1"}], "edges": [], "topics": {}});
        assert!(build_graph_from_value(&project, &value).is_err());
    }
}

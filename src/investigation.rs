use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::event_bus::EventPublisher;
use crate::graph::citations_from_value;
use crate::pathway::{build_task_for_level, PathwayRegistry};
use crate::strategos::StrategosClient;
use crate::types::{
    Branch, BranchCondition, BranchOperator, BranchTarget, Citation, Confidence, EvidenceItem,
    EvidenceType, InformationCredibility, LevelOutput, Pathway, PathwayLevel, PathwayResult,
    SourceReliability,
};

/// Evaluates a single branch condition against the signals a level's
/// worker output reported. Unknown fields and type-mismatched comparisons
/// resolve to `false` rather than erroring — a branch that can't be
/// evaluated simply isn't taken.
pub fn evaluate_branch(condition: &BranchCondition, signals: &HashMap<String, Value>) -> bool {
    let actual = signals.get(&condition.field);
    match condition.operator {
        BranchOperator::Exists => actual.is_some(),
        BranchOperator::NotExists => actual.is_none(),
        BranchOperator::Equals => actual == condition.value.as_ref(),
        BranchOperator::NotEquals => actual != condition.value.as_ref(),
        BranchOperator::Contains => match (actual, &condition.value) {
            (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
            (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
            _ => false,
        },
        BranchOperator::In => match (&condition.value, actual) {
            (Some(Value::Array(items)), Some(v)) => items.contains(v),
            _ => false,
        },
        BranchOperator::GreaterThan => numeric_compare(actual, &condition.value, |a, b| a > b),
        BranchOperator::LessThan => numeric_compare(actual, &condition.value, |a, b| a < b),
    }
}

fn numeric_compare(actual: Option<&Value>, expected: &Option<Value>, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(Value::as_f64), expected.as_ref().and_then(Value::as_f64)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn satisfied_branches<'a>(level: &'a PathwayLevel, signals: &HashMap<String, Value>) -> Vec<&'a Branch> {
    level
        .branches
        .iter()
        .filter(|b| evaluate_branch(&b.condition, signals))
        .collect()
}

/// Reads a worker's parsed JSON output into a `LevelOutput`, defensively
/// field-by-field since `requiredOutputs` schemas vary per pathway level
/// and a worker may omit fields the current branch doesn't need.
fn level_output_from_value(depth: u8, value: &Value) -> LevelOutput {
    let evidence_found = value.get("evidence_found").and_then(Value::as_bool).unwrap_or(false);
    let source_rating = value
        .get("source_rating")
        .and_then(|v| serde_json::from_value::<SourceReliability>(v.clone()).ok());
    let info_rating = value
        .get("info_rating")
        .and_then(Value::as_u64)
        .and_then(|n| InformationCredibility::new(n as u8).ok());
    let findings = value.get("findings").cloned().unwrap_or(Value::Null);
    let branch_signals: HashMap<String, Value> = value
        .get("branch_signals")
        .and_then(Value::as_object)
        .map(|m| m.clone().into_iter().collect())
        .unwrap_or_default();
    let citations: Vec<Citation> = value
        .get("citations")
        .map(citations_from_value)
        .unwrap_or_default();
    let next_evidence_types: Vec<EvidenceType> = value
        .get("next_evidence_types")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| serde_json::from_value::<EvidenceType>(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    LevelOutput {
        depth,
        evidence_found,
        source_rating,
        info_rating,
        findings,
        branch_signals,
        citations,
        next_evidence_types,
        gap: false,
    }
}

fn gap_level_output(depth: u8) -> LevelOutput {
    LevelOutput {
        depth,
        gap: true,
        ..Default::default()
    }
}

/// Field-presence check against a level's `requiredOutputs` schema object
/// (`{"fieldName": "typeName"}`). Presence-only: the per-field type tag is
/// informational for worker prompting, not enforced again here — the typed
/// extraction in `level_output_from_value` already coerces or drops
/// malformed values.
fn satisfies_required_outputs(value: &Value, schema: &Value) -> bool {
    let Some(schema_obj) = schema.as_object() else {
        return true;
    };
    let Some(value_obj) = value.as_object() else {
        return false;
    };
    schema_obj.keys().all(|field| value_obj.contains_key(field))
}

/// Deterministic, per-evidence-item confidence factors derived from every
/// pathway level's signals. Kept as a flat struct (rather than re-scanning
/// `PathwayResult`s at each decision point) so `compute_confidence` stays a
/// pure function over a small fixed shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfidenceFactors {
    pub retracted: bool,
    pub contradiction: bool,
    pub ab_confirmations: usize,
    pub c_or_lower_confirmations: usize,
    pub unresolved_bias_flag: bool,
    pub methodology_unsound: bool,
    pub industry_funded_without_replication: bool,
    pub testimonial_only: bool,
    pub preclinical_only: bool,
    pub small_sample_size: bool,
    pub p_hacking_or_cherry_picking: bool,
    pub credible_contrarian: bool,
    pub large_effect_size: bool,
    pub dose_response_confirmed: bool,
}

fn signal_bool(level: &LevelOutput, key: &str) -> bool {
    level.branch_signals.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn signal_number(level: &LevelOutput, key: &str) -> Option<f64> {
    level.branch_signals.get(key).and_then(Value::as_f64)
}

/// Scans every non-gap level across a set of pathway results for one
/// evidence item and tallies the signals the confidence rules key off.
pub fn derive_confidence_factors(results: &[PathwayResult]) -> ConfidenceFactors {
    let mut factors = ConfidenceFactors::default();

    for result in results {
        for level in &result.levels {
            if level.gap {
                continue;
            }
            if signal_bool(level, "retracted") {
                factors.retracted = true;
            }
            if signal_bool(level, "contradicts") {
                factors.contradiction = true;
            }
            if signal_bool(level, "bias_flag") {
                factors.unresolved_bias_flag = true;
            }
            if signal_bool(level, "methodology_unsound") {
                factors.methodology_unsound = true;
            }
            if signal_bool(level, "industry_funded") && !signal_bool(level, "independent_replication") {
                factors.industry_funded_without_replication = true;
            }
            if signal_bool(level, "testimonial_only") {
                factors.testimonial_only = true;
            }
            if signal_bool(level, "case_report_only")
                || signal_bool(level, "animal_study_only")
                || signal_bool(level, "in_vitro_only")
            {
                factors.preclinical_only = true;
            }
            if let Some(n) = signal_number(level, "sample_size") {
                if n < 30.0 {
                    factors.small_sample_size = true;
                }
            }
            if signal_bool(level, "p_hacking") || signal_bool(level, "cherry_picking") {
                factors.p_hacking_or_cherry_picking = true;
            }
            if signal_bool(level, "contrarian_credible") {
                factors.credible_contrarian = true;
            }
            if let Some(effect) = signal_number(level, "effect_size") {
                if effect > 5.0 || effect < 0.2 {
                    factors.large_effect_size = true;
                }
            }
            if signal_bool(level, "dose_response_confirmed") {
                factors.dose_response_confirmed = true;
            }

            if level.evidence_found {
                match level.source_rating {
                    Some(SourceReliability::A) | Some(SourceReliability::B) => factors.ab_confirmations += 1,
                    Some(_) => factors.c_or_lower_confirmations += 1,
                    None => {}
                }
            }
        }
    }

    factors
}

/// Exposed for the adjudicate phase, which applies the same one-level
/// downgrade when a credible contrarian pathway result contradicts a
/// high-consensus claim (see `pipeline::run_adjudicate`).
pub fn downgrade(confidence: Confidence) -> Confidence {
    match confidence {
        Confidence::V => Confidence::P,
        Confidence::P => Confidence::U,
        other => other,
    }
}

fn upgrade(confidence: Confidence) -> Confidence {
    match confidence {
        Confidence::U => Confidence::P,
        Confidence::P => Confidence::V,
        other => other,
    }
}

/// Pure confidence computation. Retraction and contradiction short-circuit
/// to `R`/`D`; otherwise a base rating is derived from confirmation counts,
/// caps are applied (capped base ratings land on `P`), then downgrade
/// modifiers apply before upgrade modifiers. That ordering isn't pinned by
/// the rules as given; applying caps first keeps a "weak evidence" signal
/// from being erased by an upgrade modifier that fires on the same item.
pub fn compute_confidence(factors: &ConfidenceFactors) -> Confidence {
    if factors.retracted {
        return Confidence::R;
    }
    if factors.contradiction {
        return Confidence::D;
    }

    let mut confidence = if factors.ab_confirmations >= 3 && !factors.unresolved_bias_flag && !factors.methodology_unsound {
        Confidence::V
    } else if (1..=2).contains(&factors.ab_confirmations)
        || factors.c_or_lower_confirmations >= 3
        || factors.unresolved_bias_flag
    {
        Confidence::P
    } else {
        Confidence::U
    };

    let capped = factors.industry_funded_without_replication
        || factors.testimonial_only
        || factors.preclinical_only
        || factors.small_sample_size;
    if capped && confidence == Confidence::V {
        confidence = Confidence::P;
    }

    if factors.p_hacking_or_cherry_picking {
        confidence = downgrade(confidence);
    }
    if factors.credible_contrarian {
        confidence = downgrade(confidence);
    }
    if factors.large_effect_size {
        confidence = upgrade(confidence);
    }
    if factors.dose_response_confirmed {
        confidence = upgrade(confidence);
    }

    confidence
}

/// Result of walking one branch (and its descendants) of a pathway tree.
#[derive(Debug, Default)]
struct BranchOutcome {
    levels: Vec<LevelOutput>,
    spawn_requests: Vec<EvidenceType>,
    terminated: bool,
}

/// Full result of investigating one evidence item through its triggered
/// pathway.
#[derive(Debug)]
pub struct InvestigationOutcome {
    pub result: PathwayResult,
    pub spawn_requests: Vec<EvidenceType>,
    pub terminated: bool,
}

/// Executes pathway trees for evidence items, one tree per `(pathway,
/// evidenceItem)` pair, talking to the worker runtime through
/// `StrategosClient` and publishing progress through `EventPublisher`.
pub struct InvestigationTree {
    pathways: Arc<PathwayRegistry>,
    client: Arc<dyn StrategosClient>,
    events: Arc<dyn EventPublisher>,
}

impl InvestigationTree {
    pub fn new(
        pathways: Arc<PathwayRegistry>,
        client: Arc<dyn StrategosClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Arc<Self> {
        Arc::new(InvestigationTree {
            pathways,
            client,
            events,
        })
    }

    pub async fn investigate(
        self: &Arc<Self>,
        project_id: &str,
        project_path: &Path,
        evidence: &EvidenceItem,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<InvestigationOutcome, EngineError> {
        let pathway = Arc::new(self.pathways.get(&evidence.triggered_pathway)?.clone());
        let first_level = pathway
            .levels
            .first()
            .ok_or_else(|| EngineError::InvariantViolation(format!("pathway {} has no levels", pathway.id)))?
            .clone();
        let evidence_value = Arc::new(
            serde_json::to_value(evidence)
                .map_err(|e| EngineError::InvariantViolation(format!("evidence item not serializable: {}", e)))?,
        );

        self.events
            .publish(
                project_id,
                "pathway_started",
                serde_json::json!({"pathwayId": pathway.id, "evidenceId": evidence.evidence_id}),
            )
            .await;

        let outcome = run_branch(
            self.clone(),
            project_id.to_string(),
            project_path.to_path_buf(),
            pathway.clone(),
            first_level,
            evidence_value,
            Value::Null,
            4,
            cancel.clone(),
            timeout,
        )
        .await?;

        self.events
            .publish(
                project_id,
                "pathway_complete",
                serde_json::json!({"pathwayId": pathway.id, "evidenceId": evidence.evidence_id, "terminated": outcome.terminated}),
            )
            .await;

        Ok(InvestigationOutcome {
            result: PathwayResult {
                pathway_id: pathway.id.clone(),
                evidence_id: evidence.evidence_id.clone(),
                levels: outcome.levels,
            },
            spawn_requests: outcome.spawn_requests,
            terminated: outcome.terminated,
        })
    }
}

/// Free function rather than a method so the recursive `Box::pin` future is
/// fully owned (`'static`) and can be handed either to a direct `.await` or
/// to `JoinSet::spawn` for the `parallel` branch case.
fn run_branch(
    tree: Arc<InvestigationTree>,
    project_id: String,
    project_path: PathBuf,
    pathway: Arc<Pathway>,
    level: PathwayLevel,
    evidence_value: Arc<Value>,
    parent_value: Value,
    depth_budget: u8,
    cancel: CancellationToken,
    timeout: Duration,
) -> Pin<Box<dyn Future<Output = Result<BranchOutcome, EngineError>> + Send>> {
    Box::pin(async move {
        if depth_budget == 0 {
            return Ok(BranchOutcome::default());
        }

        let task = build_task_for_level(&level, &evidence_value, &parent_value);
        let label = format!("{}-L{}", pathway.id, level.depth);

        let worker_id = tree
            .client
            .spawn(level.worker_template, &label, &project_path, None, &task.description())
            .await?;
        tree.events
            .publish(
                &project_id,
                "worker_spawned",
                serde_json::json!({"workerId": worker_id, "pathwayId": pathway.id, "depth": level.depth}),
            )
            .await;

        let wait = tree.client.wait_for_done(&worker_id, timeout, &cancel).await?;
        tree.events
            .publish(
                &project_id,
                "worker_done",
                serde_json::json!({"workerId": worker_id, "ok": wait.ok, "timedOut": wait.timed_out, "reason": wait.reason()}),
            )
            .await;

        if !wait.ok {
            // Timeouts and worker-side failures are gaps, never errors that
            // fail the whole pathway.
            tree.events
                .publish(&project_id, "pathway_level", serde_json::json!({"pathwayId": pathway.id, "depth": level.depth, "gap": true}))
                .await;
            return Ok(BranchOutcome {
                levels: vec![gap_level_output(level.depth)],
                ..Default::default()
            });
        }

        let raw_output = wait.output.unwrap_or_default();
        let parsed = match crate::extractor::extract(&raw_output) {
            Ok(v) if satisfies_required_outputs(&v, &level.required_outputs) => Some(v),
            _ => {
                let corrective = format!(
                    "{}\n\nYour previous response could not be parsed as JSON matching the required output schema. Respond with a single valid JSON object only.",
                    task.description()
                );
                let retry_worker_id = tree
                    .client
                    .spawn(level.worker_template, &format!("{}-retry", label), &project_path, Some(&worker_id), &corrective)
                    .await?;
                let retry_wait = tree.client.wait_for_done(&retry_worker_id, timeout, &cancel).await?;
                if retry_wait.ok {
                    crate::extractor::extract(&retry_wait.output.unwrap_or_default())
                        .ok()
                        .filter(|v| satisfies_required_outputs(v, &level.required_outputs))
                } else {
                    None
                }
            }
        };

        let Some(value) = parsed else {
            tree.events
                .publish(&project_id, "pathway_level", serde_json::json!({"pathwayId": pathway.id, "depth": level.depth, "gap": true}))
                .await;
            return Ok(BranchOutcome {
                levels: vec![gap_level_output(level.depth)],
                ..Default::default()
            });
        };

        let level_output = level_output_from_value(level.depth, &value);
        tree.events
            .publish(&project_id, "pathway_level", serde_json::json!({"pathwayId": pathway.id, "depth": level.depth, "gap": false}))
            .await;

        let mut outcome = BranchOutcome {
            spawn_requests: level_output.next_evidence_types.clone(),
            ..Default::default()
        };

        let satisfied = satisfied_branches(&level, &level_output.branch_signals);
        let mut terminate_hit = false;
        let mut next_depths: Vec<u8> = Vec::new();
        for branch in satisfied {
            match &branch.target {
                BranchTarget::Terminate => terminate_hit = true,
                BranchTarget::NextDepth(d) => next_depths.push(*d),
            }
        }

        let parent_value_for_children = serde_json::to_value(&level_output).unwrap_or(Value::Null);
        outcome.levels.push(level_output);

        if terminate_hit {
            tree.events
                .publish(&project_id, "pathway_branch", serde_json::json!({"pathwayId": pathway.id, "depth": level.depth, "target": "terminate"}))
                .await;
            outcome.terminated = true;
            return Ok(outcome);
        }

        next_depths.sort_unstable();
        next_depths.dedup();
        let child_levels: Vec<PathwayLevel> = next_depths
            .iter()
            .filter_map(|d| pathway.levels.iter().find(|l| l.depth == *d).cloned())
            .collect();

        if child_levels.is_empty() {
            return Ok(outcome);
        }

        if level.parallel && child_levels.len() > 1 {
            let mut joins = JoinSet::new();
            for child_level in child_levels {
                joins.spawn(run_branch(
                    tree.clone(),
                    project_id.clone(),
                    project_path.clone(),
                    pathway.clone(),
                    child_level,
                    evidence_value.clone(),
                    parent_value_for_children.clone(),
                    depth_budget - 1,
                    cancel.clone(),
                    timeout,
                ));
            }
            while let Some(joined) = joins.join_next().await {
                let child = joined
                    .map_err(|e| EngineError::InvariantViolation(format!("investigation branch task failed: {}", e)))??;
                outcome.levels.extend(child.levels);
                outcome.spawn_requests.extend(child.spawn_requests);
                outcome.terminated = outcome.terminated || child.terminated;
            }
        } else {
            for child_level in child_levels {
                let child = run_branch(
                    tree.clone(),
                    project_id.clone(),
                    project_path.clone(),
                    pathway.clone(),
                    child_level,
                    evidence_value.clone(),
                    parent_value_for_children.clone(),
                    depth_budget - 1,
                    cancel.clone(),
                    timeout,
                )
                .await?;
                outcome.levels.extend(child.levels);
                outcome.spawn_requests.extend(child.spawn_requests);
                outcome.terminated = outcome.terminated || child.terminated;
            }
        }

        Ok(outcome)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::RecordingEventPublisher;
    use crate::strategos::{MockStrategosClient, WaitOutcome};
    use crate::types::{
        Citation as CitationType, ExitCriteria, InformationCredibility as InfoCred, PathwayTrigger,
        SourceReliability as SR, TaskTemplate, WorkerTemplate,
    };
    use serde_json::json;
    use tempfile::tempdir;

    fn signals(pairs: Vec<(&str, Value)>) -> HashMap<String, Value> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn evaluate_branch_equals_and_not_equals() {
        let sig = signals(vec![("retracted", json!(true))]);
        let cond = BranchCondition {
            field: "retracted".to_string(),
            operator: BranchOperator::Equals,
            value: Some(json!(true)),
        };
        assert!(evaluate_branch(&cond, &sig));

        let cond = BranchCondition {
            field: "retracted".to_string(),
            operator: BranchOperator::NotEquals,
            value: Some(json!(false)),
        };
        assert!(evaluate_branch(&cond, &sig));
    }

    #[test]
    fn evaluate_branch_exists_and_not_exists() {
        let sig = signals(vec![("foo", json!(1))]);
        assert!(evaluate_branch(
            &BranchCondition { field: "foo".to_string(), operator: BranchOperator::Exists, value: None },
            &sig
        ));
        assert!(evaluate_branch(
            &BranchCondition { field: "bar".to_string(), operator: BranchOperator::NotExists, value: None },
            &sig
        ));
    }

    #[test]
    fn evaluate_branch_numeric_operators() {
        let sig = signals(vec![("effect_size", json!(6.0))]);
        assert!(evaluate_branch(
            &BranchCondition { field: "effect_size".to_string(), operator: BranchOperator::GreaterThan, value: Some(json!(5.0)) },
            &sig
        ));
        assert!(!evaluate_branch(
            &BranchCondition { field: "effect_size".to_string(), operator: BranchOperator::LessThan, value: Some(json!(5.0)) },
            &sig
        ));
    }

    #[test]
    fn evaluate_branch_contains_and_in() {
        let sig = signals(vec![("tags", json!(["a", "b"]))]);
        assert!(evaluate_branch(
            &BranchCondition { field: "tags".to_string(), operator: BranchOperator::Contains, value: Some(json!("a")) },
            &sig
        ));
        let sig2 = signals(vec![("rating", json!("C"))]);
        assert!(evaluate_branch(
            &BranchCondition { field: "rating".to_string(), operator: BranchOperator::In, value: Some(json!(["A", "B", "C"])) },
            &sig2
        ));
    }

    #[test]
    fn confidence_retraction_short_circuits_to_r() {
        let mut factors = ConfidenceFactors::default();
        factors.retracted = true;
        factors.ab_confirmations = 5;
        assert_eq!(compute_confidence(&factors), Confidence::R);
    }

    #[test]
    fn confidence_contradiction_short_circuits_to_d() {
        let mut factors = ConfidenceFactors::default();
        factors.contradiction = true;
        assert_eq!(compute_confidence(&factors), Confidence::D);
    }

    #[test]
    fn confidence_three_ab_confirmations_clean_is_verified() {
        let mut factors = ConfidenceFactors::default();
        factors.ab_confirmations = 3;
        assert_eq!(compute_confidence(&factors), Confidence::V);
    }

    #[test]
    fn confidence_small_sample_caps_verified_to_plausible() {
        let mut factors = ConfidenceFactors::default();
        factors.ab_confirmations = 3;
        factors.small_sample_size = true;
        assert_eq!(compute_confidence(&factors), Confidence::P);
    }

    #[test]
    fn confidence_single_confirmation_is_plausible() {
        let mut factors = ConfidenceFactors::default();
        factors.ab_confirmations = 1;
        assert_eq!(compute_confidence(&factors), Confidence::P);
    }

    #[test]
    fn confidence_no_confirmations_is_unverified() {
        let factors = ConfidenceFactors::default();
        assert_eq!(compute_confidence(&factors), Confidence::U);
    }

    #[test]
    fn confidence_large_effect_size_upgrades() {
        let mut factors = ConfidenceFactors::default();
        factors.ab_confirmations = 1; // P
        factors.large_effect_size = true;
        assert_eq!(compute_confidence(&factors), Confidence::V);
    }

    #[test]
    fn confidence_credible_contrarian_downgrades() {
        let mut factors = ConfidenceFactors::default();
        factors.ab_confirmations = 3; // V
        factors.credible_contrarian = true;
        assert_eq!(compute_confidence(&factors), Confidence::P);
    }

    fn simple_pathway(id: &str) -> Pathway {
        Pathway {
            id: id.to_string(),
            name: "Scientific literature".to_string(),
            version: "1.0.0".to_string(),
            trigger: PathwayTrigger {
                evidence_type: EvidenceType::Sci,
                condition: None,
            },
            levels: vec![PathwayLevel {
                depth: 1,
                worker_template: WorkerTemplate::Research,
                task: TaskTemplate {
                    purpose: "Investigate {evidence.description}".to_string(),
                    key_tasks: vec![],
                    end_state: "Report findings".to_string(),
                },
                required_outputs: json!({"evidence_found": "bool"}),
                branches: vec![Branch {
                    condition: BranchCondition {
                        field: "retracted".to_string(),
                        operator: BranchOperator::Equals,
                        value: Some(json!(true)),
                    },
                    target: BranchTarget::Terminate,
                }],
                parallel: false,
            }],
            exit_criteria: ExitCriteria {
                minimum_sources: 1,
                required_levels: 1,
                timeout_minutes: 15,
            },
        }
    }

    fn sample_evidence() -> EvidenceItem {
        EvidenceItem {
            evidence_id: "EV-1".to_string(),
            sub_question_id: "Q-1".to_string(),
            evidence_type: EvidenceType::Sci,
            description: "microplastics toxicity".to_string(),
            citation: CitationType {
                text: "a paper".to_string(),
                doi: None,
                pmid: None,
                url: None,
                year: None,
            },
            source_reliability: SR::A,
            information_credibility: InfoCred::new(2).unwrap(),
            triggered_pathway: "P-SCI".to_string(),
        }
    }

    #[tokio::test]
    async fn immediate_retraction_terminates_pathway() {
        let pathways = PathwayRegistry::from_pathways(vec![simple_pathway("P-SCI")]).unwrap();
        let client = Arc::new(MockStrategosClient::new());
        client
            .script_wait(
                "mock-worker-P-SCI-L1",
                WaitOutcome {
                    ok: true,
                    output: Some(json!({"evidence_found": true, "branch_signals": {"retracted": true}}).to_string()),
                    error: None,
                    timed_out: false,
                },
            )
            .await;
        let events = Arc::new(RecordingEventPublisher::new());
        let tree = InvestigationTree::new(Arc::new(pathways), client.clone(), events.clone());

        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let outcome = tree
            .investigate("p1", dir.path(), &sample_evidence(), Duration::from_secs(5), &cancel)
            .await
            .unwrap();

        assert!(outcome.terminated);
        assert_eq!(outcome.result.levels.len(), 1);
        assert!(outcome.result.levels[0].branch_signals.get("retracted").is_some());
    }

    #[tokio::test]
    async fn worker_timeout_becomes_gap_not_error() {
        let pathways = PathwayRegistry::from_pathways(vec![simple_pathway("P-SCI")]).unwrap();
        let client = Arc::new(MockStrategosClient::new());
        client.script_wait("mock-worker-P-SCI-L1", WaitOutcome { ok: false, output: None, error: Some("timeout".into()), timed_out: true }).await;
        let events = Arc::new(RecordingEventPublisher::new());
        let tree = InvestigationTree::new(Arc::new(pathways), client.clone(), events);

        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let outcome = tree
            .investigate("p1", dir.path(), &sample_evidence(), Duration::from_secs(5), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.result.levels.len(), 1);
        assert!(outcome.result.levels[0].gap);
        assert!(!outcome.terminated);
    }

    #[tokio::test]
    async fn unparseable_output_becomes_gap_after_one_retry() {
        let pathways = PathwayRegistry::from_pathways(vec![simple_pathway("P-SCI")]).unwrap();
        let client = Arc::new(MockStrategosClient::new());
        client
            .script_wait(
                "mock-worker-P-SCI-L1",
                WaitOutcome {
                    ok: true,
                    output: Some("not json at all".to_string()),
                    error: None,
                    timed_out: false,
                },
            )
            .await;
        client
            .script_wait(
                "mock-worker-P-SCI-L1-retry",
                WaitOutcome {
                    ok: true,
                    output: Some("still not json".to_string()),
                    error: None,
                    timed_out: false,
                },
            )
            .await;
        let events = Arc::new(RecordingEventPublisher::new());
        let tree = InvestigationTree::new(Arc::new(pathways), client.clone(), events);

        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let outcome = tree
            .investigate("p1", dir.path(), &sample_evidence(), Duration::from_secs(5), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.result.levels.len(), 1);
        assert!(outcome.result.levels[0].gap);
    }
}

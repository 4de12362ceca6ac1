use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::types::{Citation, Edge, EdgeType, Graph, Node, NodeConfidence, NodeType};

/// Optional fields for `build_node`, kept separate from the required
/// `(id, label, type)` triple so the common case stays a short call.
#[derive(Debug, Clone, Default)]
pub struct NodeOpts {
    pub severity: Option<String>,
    pub confidence: Option<NodeConfidence>,
    pub confidence_score: Option<f64>,
    pub parent: Option<String>,
    pub summary: Option<String>,
    pub key_stats: HashMap<String, Value>,
    /// Uppercase the label. Never forced — the caller opts in.
    pub normalize_label: bool,
}

/// Constructs a `Node`. The `type` parameter is already the closed Rust enum
/// so there is no invalid-type string to reject here; callers parsing
/// worker-supplied type strings do so through `NodeType`'s own
/// `Deserialize`, which is where an unknown type is rejected.
pub fn build_node(id: impl Into<String>, label: impl Into<String>, node_type: NodeType, opts: NodeOpts) -> Node {
    let label = label.into();
    Node {
        id: id.into(),
        label: if opts.normalize_label {
            label.to_uppercase()
        } else {
            label
        },
        node_type,
        severity: opts.severity,
        confidence: opts.confidence,
        confidence_score: opts.confidence_score,
        parent: opts.parent,
        summary: opts.summary,
        key_stats: opts.key_stats,
    }
}

#[derive(Debug, Clone, Default)]
pub struct EdgeOpts {
    pub confidence: Option<f64>,
    pub weight: Option<u32>,
    pub citations: Vec<Citation>,
}

pub fn build_edge(
    source: impl Into<String>,
    target: impl Into<String>,
    label: impl Into<String>,
    edge_type: EdgeType,
    opts: EdgeOpts,
) -> Edge {
    Edge {
        source: source.into(),
        target: target.into(),
        label: label.into(),
        edge_type,
        confidence: opts.confidence,
        weight: opts.weight,
        citations: opts.citations,
    }
}

/// Reads a `citations` field that may be a bare string, a single structured
/// object, or an array of either — the same string-tolerant shape `Citation`
/// itself accepts, lifted to the array level so a worker that emits one
/// citation instead of a singleton array still round-trips.
pub fn citations_from_value(value: &Value) -> Vec<Citation> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| serde_json::from_value::<Citation>(v.clone()).ok())
            .collect(),
        other => serde_json::from_value::<Citation>(other.clone())
            .map(|c| vec![c])
            .unwrap_or_default(),
    }
}

/// Domain/range constraint for one edge type: the node types an edge of
/// that type is allowed to originate from and land on.
struct EdgeRule {
    edge_type: EdgeType,
    sources: &'static [NodeType],
    targets: &'static [NodeType],
}

use NodeType::*;

const EDGE_RULES: &[EdgeRule] = &[
    EdgeRule {
        edge_type: EdgeType::Causation,
        sources: &[Contaminant, Context],
        targets: &[HealthEffect],
    },
    EdgeRule {
        edge_type: EdgeType::Evidence,
        sources: &[Investigation],
        targets: &[Contaminant, HealthEffect, Solution, Product, Recommendation, Context],
    },
    EdgeRule {
        edge_type: EdgeType::Composition,
        sources: &[Product],
        targets: &[Contaminant],
    },
    EdgeRule {
        edge_type: EdgeType::Addresses,
        sources: &[Solution, Recommendation],
        targets: &[Contaminant, HealthEffect],
    },
    EdgeRule {
        edge_type: EdgeType::Gap,
        sources: &[Investigation],
        targets: &[Contaminant, HealthEffect, Solution, Product, Recommendation, Context],
    },
    EdgeRule {
        edge_type: EdgeType::Contextualizes,
        sources: &[Context],
        targets: &[Contaminant, HealthEffect, Solution, Product, Recommendation, Domain],
    },
    EdgeRule {
        edge_type: EdgeType::Investigates,
        sources: &[Investigation],
        targets: &[Contaminant, HealthEffect, Solution, Product, Recommendation, Context, Domain],
    },
];

fn rule_for(edge_type: EdgeType) -> &'static EdgeRule {
    EDGE_RULES
        .iter()
        .find(|r| r.edge_type == edge_type)
        .expect("every EdgeType variant has a rule in EDGE_RULES")
}

/// Runs the seven §3.7 graph invariants as independent passes, collecting
/// everything that's wrong rather than stopping at the first violation —
/// the same "collect all errors, then report" shape as a multi-phase
/// preflight validator.
pub fn validate(graph: &Graph) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let warnings = Vec::new();

    let node_ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
    check_node_id_uniqueness(graph, &mut errors);
    check_edge_endpoints_resolve(graph, &node_ids, &mut errors);
    check_parents_resolve(graph, &node_ids, &mut errors);
    check_edge_domain_range(graph, &mut errors);
    check_topic_coverage(graph, &mut errors);
    check_no_isolated_non_domain_nodes(graph, &mut errors);

    (errors, warnings)
}

fn check_node_id_uniqueness(graph: &Graph, errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id: {}", node.id));
        }
    }
}

fn check_edge_endpoints_resolve(graph: &Graph, node_ids: &HashSet<&str>, errors: &mut Vec<String>) {
    for edge in &graph.edges {
        if !node_ids.contains(edge.source.as_str()) {
            errors.push(format!(
                "edge {}->{} references unknown source node {}",
                edge.source, edge.target, edge.source
            ));
        }
        if !node_ids.contains(edge.target.as_str()) {
            errors.push(format!(
                "edge {}->{} references unknown target node {}",
                edge.source, edge.target, edge.target
            ));
        }
    }
}

fn check_parents_resolve(graph: &Graph, node_ids: &HashSet<&str>, errors: &mut Vec<String>) {
    for node in &graph.nodes {
        if let Some(parent) = &node.parent {
            if !node_ids.contains(parent.as_str()) {
                errors.push(format!("node {} references unknown parent {}", node.id, parent));
            }
        }
    }
}

fn check_edge_domain_range(graph: &Graph, errors: &mut Vec<String>) {
    let nodes_by_id: HashMap<&str, &Node> = graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    for edge in &graph.edges {
        let (Some(source), Some(target)) = (nodes_by_id.get(edge.source.as_str()), nodes_by_id.get(edge.target.as_str())) else {
            continue; // already reported as a dangling reference
        };
        let rule = rule_for(edge.edge_type);
        if !rule.sources.contains(&source.node_type) || !rule.targets.contains(&target.node_type) {
            errors.push(format!(
                "edge {}->{} of type {:?} violates domain/range: {:?} -> {:?} not permitted",
                edge.source, edge.target, edge.edge_type, source.node_type, target.node_type
            ));
        }
    }
}

fn check_topic_coverage(graph: &Graph, errors: &mut Vec<String>) {
    for node in &graph.nodes {
        if node.node_type == NodeType::Domain {
            continue;
        }
        match graph.topics.get(&node.id) {
            None => errors.push(format!("node {} has no topic entry", node.id)),
            Some(entry) => {
                if entry.sections.iter().all(|s| s.trim().is_empty()) {
                    errors.push(format!("node {} topic entry has no non-empty sections", node.id));
                }
            }
        }
    }
}

fn check_no_isolated_non_domain_nodes(graph: &Graph, errors: &mut Vec<String>) {
    let mut referenced: HashSet<&str> = HashSet::new();
    for edge in &graph.edges {
        referenced.insert(edge.source.as_str());
        referenced.insert(edge.target.as_str());
    }
    for node in &graph.nodes {
        if let Some(parent) = &node.parent {
            referenced.insert(parent.as_str());
        }
    }
    for node in &graph.nodes {
        if node.node_type == NodeType::Domain {
            continue;
        }
        if !referenced.contains(node.id.as_str()) {
            errors.push(format!(
                "node {} is structurally isolated (not in any edge, not a parent)",
                node.id
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfidenceDistribution, GraphMeta, TopicEntry};

    fn meta() -> GraphMeta {
        GraphMeta {
            topic: "microplastics".to_string(),
            project_id: "p1".to_string(),
            created: "2026-01-01T00:00:00Z".to_string(),
            pipeline_version: "1.0.0".to_string(),
            node_count: 0,
            edge_count: 0,
            confidence_distribution: ConfidenceDistribution::default(),
        }
    }

    fn topic(sections: Vec<&str>) -> TopicEntry {
        TopicEntry {
            title: "t".to_string(),
            sections: sections.into_iter().map(|s| s.to_string()).collect(),
            citations: vec![],
            data_sources: vec![],
        }
    }

    #[test]
    fn build_node_normalizes_label_only_when_requested() {
        let n = build_node("n1", "water", NodeType::Contaminant, NodeOpts::default());
        assert_eq!(n.label, "water");

        let n = build_node(
            "n1",
            "water",
            NodeType::Contaminant,
            NodeOpts {
                normalize_label: true,
                ..Default::default()
            },
        );
        assert_eq!(n.label, "WATER");
    }

    #[test]
    fn citations_from_value_accepts_bare_string_and_array() {
        let single = citations_from_value(&serde_json::json!("a paper"));
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].text, "a paper");

        let many = citations_from_value(&serde_json::json!([{"text": "a"}, "b"]));
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].text, "b");

        assert!(citations_from_value(&serde_json::Value::Null).is_empty());
    }

    #[test]
    fn valid_graph_has_no_errors() {
        let graph = Graph {
            meta: meta(),
            nodes: vec![
                build_node("dom", "Domain", NodeType::Domain, NodeOpts::default()),
                build_node("cont", "Microplastics", NodeType::Contaminant, NodeOpts::default()),
                build_node("he", "Endocrine disruption", NodeType::HealthEffect, NodeOpts::default()),
            ],
            edges: vec![build_edge("cont", "he", "causes", EdgeType::Causation, EdgeOpts::default())],
            topics: HashMap::from([
                ("cont".to_string(), topic(vec!["intro"])),
                ("he".to_string(), topic(vec!["intro"])),
            ]),
        };
        let (errors, _) = validate(&graph);
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn detects_duplicate_node_ids() {
        let mut graph = Graph {
            meta: meta(),
            nodes: vec![
                build_node("n1", "a", NodeType::Contaminant, NodeOpts::default()),
                build_node("n1", "b", NodeType::Contaminant, NodeOpts::default()),
            ],
            edges: vec![],
            topics: HashMap::new(),
        };
        graph
            .topics
            .insert("n1".to_string(), topic(vec!["s"]));
        let (errors, _) = validate(&graph);
        assert!(errors.iter().any(|e| e.contains("duplicate node id")));
    }

    #[test]
    fn detects_dangling_edge_endpoints() {
        let graph = Graph {
            meta: meta(),
            nodes: vec![build_node("n1", "a", NodeType::Contaminant, NodeOpts::default())],
            edges: vec![build_edge("n1", "missing", "x", EdgeType::Evidence, EdgeOpts::default())],
            topics: HashMap::from([("n1".to_string(), topic(vec!["s"]))]),
        };
        let (errors, _) = validate(&graph);
        assert!(errors.iter().any(|e| e.contains("unknown target node")));
    }

    #[test]
    fn detects_dangling_parent() {
        let graph = Graph {
            meta: meta(),
            nodes: vec![build_node(
                "n1",
                "a",
                NodeType::Contaminant,
                NodeOpts {
                    parent: Some("ghost".to_string()),
                    ..Default::default()
                },
            )],
            edges: vec![],
            topics: HashMap::from([("n1".to_string(), topic(vec!["s"]))]),
        };
        let (errors, _) = validate(&graph);
        assert!(errors.iter().any(|e| e.contains("unknown parent")));
    }

    #[test]
    fn detects_domain_range_violation() {
        let graph = Graph {
            meta: meta(),
            nodes: vec![
                build_node("a", "a", NodeType::HealthEffect, NodeOpts::default()),
                build_node("b", "b", NodeType::Contaminant, NodeOpts::default()),
            ],
            edges: vec![build_edge("a", "b", "causes", EdgeType::Causation, EdgeOpts::default())],
            topics: HashMap::from([
                ("a".to_string(), topic(vec!["s"])),
                ("b".to_string(), topic(vec!["s"])),
            ]),
        };
        let (errors, _) = validate(&graph);
        assert!(errors.iter().any(|e| e.contains("domain/range")));
    }

    #[test]
    fn detects_missing_topic_coverage() {
        let graph = Graph {
            meta: meta(),
            nodes: vec![build_node("n1", "a", NodeType::Contaminant, NodeOpts::default())],
            edges: vec![],
            topics: HashMap::new(),
        };
        let (errors, _) = validate(&graph);
        assert!(errors.iter().any(|e| e.contains("no topic entry")));
    }

    #[test]
    fn domain_nodes_are_exempt_from_topic_coverage() {
        let graph = Graph {
            meta: meta(),
            nodes: vec![build_node("dom", "Domain", NodeType::Domain, NodeOpts::default())],
            edges: vec![],
            topics: HashMap::new(),
        };
        let (errors, _) = validate(&graph);
        assert!(errors.is_empty());
    }

    #[test]
    fn detects_structurally_isolated_non_domain_node() {
        let graph = Graph {
            meta: meta(),
            nodes: vec![build_node("n1", "a", NodeType::Contaminant, NodeOpts::default())],
            edges: vec![],
            topics: HashMap::from([("n1".to_string(), topic(vec!["s"]))]),
        };
        let (errors, _) = validate(&graph);
        assert!(errors.iter().any(|e| e.contains("structurally isolated")));
    }

    #[test]
    fn node_referenced_only_as_parent_is_not_isolated() {
        let graph = Graph {
            meta: meta(),
            nodes: vec![
                build_node("parent", "a", NodeType::Contaminant, NodeOpts::default()),
                build_node(
                    "child",
                    "b",
                    NodeType::Contaminant,
                    NodeOpts {
                        parent: Some("parent".to_string()),
                        ..Default::default()
                    },
                ),
            ],
            edges: vec![],
            topics: HashMap::from([
                ("parent".to_string(), topic(vec!["s"])),
                ("child".to_string(), topic(vec!["s"])),
            ]),
        };
        let (errors, _) = validate(&graph);
        assert!(!errors.iter().any(|e| e.contains("parent") && e.contains("isolated")));
    }

    #[test]
    fn edge_type_and_node_type_serialized_forms_never_collide() {
        let edge_forms: HashSet<String> = [
            EdgeType::Causation,
            EdgeType::Evidence,
            EdgeType::Composition,
            EdgeType::Addresses,
            EdgeType::Gap,
            EdgeType::Contextualizes,
            EdgeType::Investigates,
        ]
        .iter()
        .map(|e| serde_json::to_string(e).unwrap())
        .collect();
        let node_forms: HashSet<String> = [
            NodeType::Domain,
            NodeType::Contaminant,
            NodeType::HealthEffect,
            NodeType::Solution,
            NodeType::Product,
            NodeType::Recommendation,
            NodeType::Context,
            NodeType::Investigation,
        ]
        .iter()
        .map(|n| serde_json::to_string(n).unwrap())
        .collect();
        assert!(edge_forms.is_disjoint(&node_forms));
    }
}

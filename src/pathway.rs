use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde_json::Value;

use crate::error::EngineError;
use crate::types::{Pathway, PathwayLevel};
use crate::log_info;

/// A worker task description built from a pathway level's templates with
/// `{evidence.*, parent.*}` placeholders resolved against the triggering
/// evidence item and the parent level's output.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltTask {
    pub purpose: String,
    pub key_tasks: Vec<String>,
    pub end_state: String,
    pub required_outputs: Value,
}

impl BuiltTask {
    /// Flattens purpose/key-tasks/end-state into the single task description
    /// string handed to `StrategosClient::spawn`.
    pub fn description(&self) -> String {
        let mut sections = vec![format!("Purpose: {}", self.purpose)];
        if !self.key_tasks.is_empty() {
            let tasks = self
                .key_tasks
                .iter()
                .map(|t| format!("- {}", t))
                .collect::<Vec<_>>()
                .join("\n");
            sections.push(format!("Key tasks:\n{}", tasks));
        }
        sections.push(format!("End state: {}", self.end_state));
        sections.join("\n\n")
    }
}

/// Read-only, immutable-after-load registry of pathway definitions.
pub struct PathwayRegistry {
    pathways: HashMap<String, Pathway>,
}

impl PathwayRegistry {
    /// Loads every `*.json` file in `dir` as a pathway definition, validating
    /// each against the pathway schema. A single invalid file fails the
    /// whole load — pathways are read-only reference data, not a
    /// best-effort accumulation.
    pub fn load_dir(dir: &Path) -> Result<Self, EngineError> {
        let mut pathways = HashMap::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| EngineError::InvalidInput(format!("cannot read pathway dir {}: {}", dir.display(), e)))?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let pathway: Pathway = serde_json::from_str(&contents).map_err(|e| {
                EngineError::InvalidInput(format!("invalid pathway json {}: {}", path.display(), e))
            })?;
            pathway.validate().map_err(EngineError::InvalidInput)?;

            if pathways.contains_key(&pathway.id) {
                return Err(EngineError::InvalidInput(format!(
                    "duplicate pathway id {} (from {})",
                    pathway.id,
                    path.display()
                )));
            }
            log_info!("[pathway] loaded {} ({})", pathway.id, pathway.name);
            pathways.insert(pathway.id.clone(), pathway);
        }

        Ok(PathwayRegistry { pathways })
    }

    pub fn from_pathways(pathways: Vec<Pathway>) -> Result<Self, EngineError> {
        let mut map = HashMap::new();
        for pathway in pathways {
            pathway.validate().map_err(EngineError::InvalidInput)?;
            if map.contains_key(&pathway.id) {
                return Err(EngineError::InvalidInput(format!(
                    "duplicate pathway id {}",
                    pathway.id
                )));
            }
            map.insert(pathway.id.clone(), pathway);
        }
        Ok(PathwayRegistry { pathways: map })
    }

    pub fn get(&self, id: &str) -> Result<&Pathway, EngineError> {
        self.pathways
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("pathway {} not registered", id)))
    }

    pub fn ids(&self) -> HashSet<String> {
        self.pathways.keys().cloned().collect()
    }

    /// Interpolates a level's task templates against the evidence item and
    /// the parent level's output (both as arbitrary JSON values so the
    /// resolver works uniformly across pathway-specific shapes). Unknown
    /// placeholders resolve to the empty string, never the literal
    /// `"undefined"`.
    pub fn build_task(
        &self,
        level: &PathwayLevel,
        evidence: &Value,
        parent: &Value,
    ) -> BuiltTask {
        build_task_for_level(level, evidence, parent)
    }
}

/// Free-function form of `PathwayRegistry::build_task`, usable by callers
/// (the investigation-tree executor) that only hold a single `&PathwayLevel`
/// rather than a whole registry.
pub fn build_task_for_level(level: &PathwayLevel, evidence: &Value, parent: &Value) -> BuiltTask {
    BuiltTask {
        purpose: interpolate(&level.task.purpose, evidence, parent),
        key_tasks: level
            .task
            .key_tasks
            .iter()
            .map(|t| interpolate(t, evidence, parent))
            .collect(),
        end_state: interpolate(&level.task.end_state, evidence, parent),
        required_outputs: level.required_outputs.clone(),
    }
}

/// Replaces every `{evidence.foo.bar}` / `{parent.foo.bar}` placeholder in
/// `template` with the dotted-path lookup against the corresponding root
/// value.
fn interpolate(template: &str, evidence: &Value, parent: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find('}') else {
            // Unmatched brace: emit the rest verbatim and stop.
            out.push_str(&rest[open..]);
            return out;
        };
        let path = &after_open[..close];
        out.push_str(&resolve_placeholder(path, evidence, parent));
        rest = &after_open[close + 1..];
    }
    out.push_str(rest);
    out
}

fn resolve_placeholder(path: &str, evidence: &Value, parent: &Value) -> String {
    let Some((root_name, rest)) = path.split_once('.') else {
        return String::new();
    };
    let root = match root_name {
        "evidence" => evidence,
        "parent" => parent,
        _ => return String::new(),
    };
    resolve_dotted(root, rest)
}

fn resolve_dotted(root: &Value, path: &str) -> String {
    let mut current = root;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(v) => current = v,
            None => return String::new(),
        }
    }
    value_to_text(current)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

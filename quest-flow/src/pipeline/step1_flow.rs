//! Stage 1: turn an authored outline into flow nodes.
//!
//! One completion call, JSON requested. The reply must contain an array of
//! nodes (top level, or the single array field of the returned object since
//! JSON-object mode wraps arrays). IDs are normalised to slugs, group nodes get
//! the group prefix, references are remapped, and the result is validated.
//! Nothing is ever substituted for a bad reply.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use quest_flow_sdk::{log_document_saved, log_file_saved, log_found, log_info};

use crate::completion::{complete_json, CompletionClient};
use crate::confirm::{Confirm, ConfirmRequest};
use crate::error::{PipelineError, Result, StoreError};
use crate::flow::types::{group_id, is_group_id, step_id};
use crate::flow::{validate_flow, FlowDocument, FlowNode, FlowStore};
use crate::utils::slugify;

pub const STAGE: usize = 1;
pub const STAGE_NAME: &str = "Flow Generator";

const FLOW_SYSTEM_PROMPT: &str = r#"You design voice quizzes that help a child shape a story before it is written.

Turn the outline you are given into a JSON object of the form {"nodes": [...]}.

Each node is either a group (a section of the quiz) or a step (one question topic):
- group: {"id": "group-<slug>", "type": "group", "name": "...", "description": "..."}
- step:  {"id": "<slug>", "name": "...", "description": "...", "dependsOn": ["..."]}

Rules:
- Keep the order of the outline.
- Every step lists the group it belongs to as the FIRST entry of dependsOn.
- Add a step ID to dependsOn only when the question needs that earlier answer.
- IDs are short lowercase slugs and unique.
- Output only the JSON object."#;

/// Generate flow nodes from outline text.
pub async fn generate_flow(client: &dyn CompletionClient, outline: &str) -> Result<Vec<FlowNode>> {
    if outline.trim().is_empty() {
        return Err(PipelineError::generation("outline is empty"));
    }

    let user = format!("# Outline\n\n{}", outline.trim());
    let reply = complete_json(client, FLOW_SYSTEM_PROMPT, &user).await?;

    let raw = extract_node_array(reply)?;
    let nodes = normalize_nodes(raw)?;
    validate_flow(&nodes).map_err(into_generation)?;
    Ok(nodes)
}

/// Find the node array in a completion reply.
pub fn extract_node_array(reply: Value) -> Result<Vec<Value>> {
    match reply {
        Value::Array(items) => Ok(items),
        Value::Object(mut object) => {
            if let Some(Value::Array(items)) = object.remove("nodes") {
                return Ok(items);
            }
            let mut arrays: Vec<Vec<Value>> = object
                .into_iter()
                .filter_map(|(_, v)| match v {
                    Value::Array(items) => Some(items),
                    _ => None,
                })
                .collect();
            match arrays.len() {
                1 => Ok(arrays.remove(0)),
                0 => Err(PipelineError::generation("response object contains no node array")),
                n => Err(PipelineError::generation(format!(
                    "response object contains {} arrays; expected exactly one",
                    n
                ))),
            }
        }
        other => Err(PipelineError::generation(format!(
            "expected a JSON array of nodes, got {}",
            json_kind(&other)
        ))),
    }
}

/// Normalise IDs and references of raw nodes and parse them.
pub fn normalize_nodes(raw: Vec<Value>) -> Result<Vec<FlowNode>> {
    let mut objects: Vec<Map<String, Value>> = Vec::with_capacity(raw.len());
    for (index, item) in raw.into_iter().enumerate() {
        match item {
            Value::Object(object) => objects.push(object),
            other => {
                return Err(PipelineError::generation(format!(
                    "node #{} is {}, expected an object",
                    index + 1,
                    json_kind(&other)
                )))
            }
        }
    }

    // First pass: assign new IDs. References resolve against original IDs
    // before derived slugs.
    let mut renamed: HashMap<String, String> = HashMap::new();
    let mut by_slug: HashMap<String, String> = HashMap::new();
    let mut taken: HashSet<String> = HashSet::new();
    let mut new_ids: Vec<String> = Vec::with_capacity(objects.len());

    for (index, object) in objects.iter_mut().enumerate() {
        let original = object
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let name = object
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let is_group = is_group_id(&original)
            || object.get("type").and_then(Value::as_str) == Some("group");
        object.remove("type");

        let mut slug = slugify(&original);
        if slug.is_empty() {
            slug = slugify(&name);
        }
        if slug.is_empty() {
            slug = format!("node-{}", index + 1);
        }

        let base = if is_group { group_id(&slug) } else { step_id(&slug) };
        let mut id = base.clone();
        let mut suffix = 2;
        while !taken.insert(id.clone()) {
            id = format!("{}-{}", base, suffix);
            suffix += 1;
        }

        if !original.is_empty() {
            renamed.entry(original.clone()).or_insert_with(|| id.clone());
        }
        by_slug.entry(slug).or_insert_with(|| id.clone());
        new_ids.push(id);
    }

    // Second pass: rewrite references and build nodes
    let mut nodes = Vec::with_capacity(objects.len());
    for (mut object, id) in objects.into_iter().zip(new_ids) {
        if let Some(deps) = object.remove("depends_on") {
            object.entry("dependsOn").or_insert(deps);
        }

        if let Some(Value::Array(deps)) = object.get_mut("dependsOn") {
            let original_deps = std::mem::take(deps);
            let mut remapped: Vec<Value> = Vec::with_capacity(original_deps.len());
            for dep in &original_deps {
                let Some(dep) = dep.as_str() else {
                    return Err(PipelineError::Generation {
                        node: Some(id.clone()),
                        message: "dependsOn entries must be strings".to_string(),
                    });
                };
                let slug = slugify(dep);
                let target = renamed
                    .get(dep)
                    .or_else(|| by_slug.get(dep))
                    .or_else(|| renamed.get(&slug))
                    .or_else(|| by_slug.get(&slug))
                    .cloned()
                    .unwrap_or_else(|| dep.to_string());
                if !remapped.iter().any(|v| v.as_str() == Some(target.as_str())) {
                    remapped.push(Value::String(target));
                }
            }
            *deps = remapped;
        }

        if object
            .get("name")
            .and_then(Value::as_str)
            .map_or(true, |n| n.trim().is_empty())
        {
            object.insert("name".to_string(), Value::String(id.clone()));
        }
        object.insert("id".to_string(), Value::String(id.clone()));

        let node: FlowNode = serde_json::from_value(Value::Object(object)).map_err(|e| {
            PipelineError::Generation {
                node: Some(id.clone()),
                message: format!("node does not match the flow schema: {}", e),
            }
        })?;
        nodes.push(node);
    }

    Ok(nodes)
}

fn into_generation(error: PipelineError) -> PipelineError {
    match error {
        PipelineError::Validation { node, message } => PipelineError::Generation { node, message },
        PipelineError::DependencyCycle { ids } => PipelineError::generation(format!(
            "generated dependencies form a cycle: {}",
            ids.join(", ")
        )),
        other => other,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Run stage 1: read the outline, generate, write a new flow document.
///
/// Returns `None` if the operator declined to overwrite an existing document.
pub async fn run_flow_stage(
    client: &dyn CompletionClient,
    outline_path: &Path,
    store: &FlowStore,
    confirm: &dyn Confirm,
) -> Result<Option<FlowDocument>> {
    let outline = tokio::fs::read_to_string(outline_path)
        .await
        .map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreError::Missing(outline_path.display().to_string())
            } else {
                StoreError::Io {
                    path: outline_path.display().to_string(),
                    source,
                }
            }
        })?;

    if store.exists() {
        let request = ConfirmRequest::destructive(format!(
            "{} already exists. Overwrite it with a newly generated flow?",
            store.path().display()
        ));
        if !confirm.confirm(&request) {
            log_info!("Keeping existing flow document {}", store.path().display());
            return Ok(None);
        }
    }

    log_info!("Generating flow from {}", outline_path.display());
    let nodes = generate_flow(client, &outline).await?;

    let steps = nodes.iter().filter(|n| n.as_step().is_some()).count();
    log_found!(nodes.len() - steps, "groups");
    log_found!(steps, "steps");

    let document = store.create(nodes)?;
    let path = store.path().display().to_string();
    log_file_saved!(&path);
    log_document_saved!(STAGE, &path, "flow document");
    Ok(Some(document))
}

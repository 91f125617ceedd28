//! Stage 5: compile a provisioned flow into the client workflow document.
//!
//! Pure assembly over the nodes; the file is written only when assembly
//! succeeds.

use indexmap::IndexMap;
use std::path::{Path, PathBuf};

use quest_flow_sdk::{log_document_saved, log_file_saved, log_stage_complete, log_stage_header, log_stage_failed};

use crate::error::{PipelineError, Result};
use crate::flow::{write_atomic, FlowNode, FlowStore, Section, StepGraph, Workflow, WorkflowStep};
use crate::utils::workflow_path_for;

pub const STAGE: usize = 5;
pub const STAGE_NAME: &str = "Workflow Assembler";

/// Section for steps that belong to no group.
pub const DEFAULT_SECTION_ID: &str = "default";
pub const DEFAULT_SECTION_TITLE: &str = "General";

/// Build the workflow: the flow needs at least one step, every step needs an
/// agent, and dependencies must resolve and be acyclic. Steps come out in
/// topological order, sections in the order their first step appears.
pub fn assemble(nodes: &[FlowNode]) -> Result<Workflow> {
    let missing: Vec<String> = nodes
        .iter()
        .filter_map(FlowNode::as_step)
        .filter(|step| step.agent_id().is_none())
        .map(|step| step.id.clone())
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MissingAgent { steps: missing });
    }

    let graph = StepGraph::build(nodes)?;
    if graph.is_empty() {
        return Err(PipelineError::validation("flow has no steps to assemble"));
    }
    let order = graph.topological_order()?;

    let mut sections: IndexMap<String, Section> = IndexMap::new();
    for index in order {
        let step = graph.step(index);
        let (id, title) = match graph.section_of(index) {
            Some(group) => (group.id.as_str(), group.name.as_str()),
            None => (DEFAULT_SECTION_ID, DEFAULT_SECTION_TITLE),
        };

        // checked above; a step without agent never reaches this point
        let Some(agent_id) = step.agent_id() else {
            continue;
        };

        sections
            .entry(id.to_string())
            .or_insert_with(|| Section {
                id: id.to_string(),
                title: title.to_string(),
                steps: Vec::new(),
            })
            .steps
            .push(WorkflowStep {
                id: step.id.clone(),
                title: step.display_name().to_string(),
                agent_id: agent_id.to_string(),
            });
    }

    Ok(Workflow {
        sections: sections.into_values().collect(),
    })
}

/// Assemble the document at `store` and write it to `output`, or next to
/// the flow as `<stem>.workflow.json`.
pub fn run_assemble_stage(store: &FlowStore, output: Option<&Path>) -> Result<(PathBuf, Workflow)> {
    log_stage_header!(
        STAGE,
        STAGE_NAME,
        "Compile the provisioned flow into the client workflow document"
    );

    let document = store.load()?;
    let workflow = match assemble(&document.nodes) {
        Ok(workflow) => workflow,
        Err(e) => {
            log_stage_failed!(STAGE, STAGE_NAME, e);
            return Err(e);
        }
    };

    let path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| workflow_path_for(store.path()));
    let mut json = serde_json::to_string_pretty(&workflow)?;
    json.push('\n');
    write_atomic(&path, json.as_bytes())?;

    let shown = path.display().to_string();
    log_file_saved!(&shown);
    log_document_saved!(STAGE, &shown, "workflow document");
    log_stage_complete!(STAGE, STAGE_NAME);
    Ok((path, workflow))
}

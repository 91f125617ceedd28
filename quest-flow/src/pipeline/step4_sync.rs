//! Stage 4: provision one remote agent per step and record the binding.
//!
//! Also home to the registry sweeps that work on a whole flow document:
//! clearing bindings, removing duplicate agents, pushing edited configs.
//! Every sweep saves the document after each step it changed.

use std::collections::HashSet;
use std::time::Duration;

use quest_flow_sdk::{
    log_document_saved, log_found, log_info, log_progress, log_stage_complete, log_stage_header,
    log_stage_start, log_warning,
};

use crate::config::{PlatformConnection, SyncPolicy};
use crate::confirm::{Confirm, ConfirmRequest};
use crate::error::{PipelineError, Result};
use crate::flow::{FlowDocument, FlowStore, ProvisionState, StepNode};
use crate::pipeline::batch::{continue_after_failure, execute_node, BatchReport, NodeContext};
use crate::registry::{AgentRegistry, ClearOutcome, DedupeReport, DeleteOutcome, ProvisionOutcome};

pub const STAGE: usize = 4;
pub const STAGE_NAME: &str = "Agent Registry Sync";

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub policy: SyncPolicy,
    /// Pause before each provision that follows a create
    pub create_delay: Duration,
}

impl SyncOptions {
    pub fn new(policy: SyncPolicy, platform: &PlatformConnection) -> Self {
        Self {
            policy,
            create_delay: Duration::from_millis(platform.create_delay_ms),
        }
    }
}

/// Why a step is not part of the sync batch, if it isn't.
fn sync_skip_reason(step: &StepNode) -> Option<String> {
    if !step.has_agent_config() {
        return Some("no elevenlabs_config; run the agent config stage first".to_string());
    }
    match step.provision_state() {
        ProvisionState::Provisioned => step
            .agent_id()
            .map(|id| format!("already provisioned as {}", id)),
        ProvisionState::Unprovisioned | ProvisionState::Cleared => None,
    }
}

/// Agents bound to steps of `document` other than `except`.
fn agents_bound_elsewhere(document: &FlowDocument, except: &str) -> HashSet<String> {
    document
        .steps()
        .filter(|step| step.id != except)
        .filter_map(StepNode::agent_id)
        .map(str::to_string)
        .collect()
}

/// Run stage 4 over every step of the document at `store`.
///
/// Bound steps are checked against the platform; a binding whose agent is
/// gone is provisioned again.
pub async fn run_sync_stage(
    registry: &AgentRegistry,
    store: &FlowStore,
    options: SyncOptions,
    confirm: &dyn Confirm,
) -> Result<BatchReport> {
    log_stage_header!(
        STAGE,
        STAGE_NAME,
        "Provision one remote agent per step and record its id"
    );

    let mut document = store.load()?;
    let mut report = BatchReport::default();
    let mut pending: Vec<String> = Vec::new();

    for step in document.steps() {
        let Some(reason) = sync_skip_reason(step) else {
            pending.push(step.id.clone());
            continue;
        };
        let Some(agent_id) = step.agent_id() else {
            report.skip(&step.id, reason);
            continue;
        };
        match registry.is_live(agent_id).await {
            Ok(true) => report.skip(&step.id, reason),
            // provision_in_flow warns and replaces the dead binding
            Ok(false) => pending.push(step.id.clone()),
            Err(e) => report.fail(&step.id, &e),
        }
    }

    if pending.is_empty() {
        log_info!("No step to provision");
        report.print_summary();
        return Ok(report);
    }

    log_found!(pending.len(), "steps to provision");
    log_info!("Sync policy for existing agents: {:?}", options.policy);
    log_stage_start!(STAGE, STAGE_NAME, pending.len());

    let mut created_before = false;

    for (index, id) in pending.iter().enumerate() {
        let Some(mut step) = document.step(id).cloned() else {
            continue;
        };

        if !confirm.confirm(&ConfirmRequest::low(format!(
            "Provision an agent for '{}' ({})?",
            step.display_name(),
            step.provision_state()
        ))) {
            report.skip(id, "declined by operator");
            continue;
        }

        if created_before && !options.create_delay.is_zero() {
            tokio::time::sleep(options.create_delay).await;
        }

        let ctx = NodeContext {
            stage: STAGE,
            node_number: index + 1,
            total_nodes: pending.len(),
        };
        let description = step.display_name().to_string();
        let bound_elsewhere = agents_bound_elsewhere(&document, id);

        let result = execute_node(ctx, id, &description, async {
            let outcome = registry
                .provision_in_flow(&mut step, &bound_elsewhere, options.policy, confirm)
                .await?;
            let summary = match &outcome {
                ProvisionOutcome::Provisioned {
                    agent_id,
                    change,
                    removed,
                } if removed.is_empty() => format!("{} {}", change, agent_id),
                ProvisionOutcome::Provisioned {
                    agent_id,
                    change,
                    removed,
                } => format!("{} {} (removed {})", change, agent_id, removed.join(", ")),
                ProvisionOutcome::AlreadyProvisioned { agent_id } => {
                    format!("already provisioned as {}", agent_id)
                }
                ProvisionOutcome::Declined => "declined; nothing changed".to_string(),
            };
            Ok::<_, PipelineError>((outcome, summary))
        })
        .await;

        match result {
            Ok(ProvisionOutcome::Declined) => {
                report.skip(id, "replacement declined by operator");
            }
            Ok(outcome) => {
                created_before |= outcome.created();
                if let Some(target) = document.step_mut(id) {
                    *target = step;
                }
                store.save(&mut document)?;
                report.done(id);
            }
            Err(e) => {
                report.fail(id, &e);
                if !continue_after_failure(confirm, id, pending.len() - index - 1) {
                    report.aborted = true;
                    break;
                }
            }
        }
    }

    log_document_saved!(STAGE, store.path().display(), "agent bindings");
    report.print_summary();
    log_stage_complete!(STAGE, STAGE_NAME);
    Ok(report)
}

/// Strip agent bindings from the document's steps.
///
/// `only` limits the sweep to one step. With `teardown` each remote agent is
/// deleted before its binding is removed.
pub async fn run_clear(
    registry: &AgentRegistry,
    store: &FlowStore,
    only: Option<&str>,
    teardown: bool,
    confirm: &dyn Confirm,
) -> Result<BatchReport> {
    let mut document = store.load()?;

    if let Some(id) = only {
        if document.step(id).is_none() {
            return Err(PipelineError::Validation {
                node: Some(id.to_string()),
                message: "no step with this id in the flow document".to_string(),
            });
        }
    }

    let targets: Vec<String> = document
        .step_ids()
        .into_iter()
        .filter(|id| only.map_or(true, |wanted| wanted == id))
        .collect();

    let mut report = BatchReport::default();
    for id in &targets {
        let Some(mut step) = document.step(id).cloned() else {
            continue;
        };

        match registry.clear(&mut step, teardown, confirm).await {
            Ok(ClearOutcome::Cleared { agent_id, remote }) => {
                if remote == Some(DeleteOutcome::AlreadyGone) {
                    log_warning!("remote agent {} of '{}' was already gone", agent_id, id);
                }
                if let Some(target) = document.step_mut(id) {
                    *target = step;
                }
                store.save(&mut document)?;
                report.done(id);
            }
            Ok(ClearOutcome::NothingToClear) => report.skip(id, "no agent bound"),
            Ok(ClearOutcome::Declined) => report.skip(id, "declined by operator"),
            Err(e) => {
                report.fail(id, &e);
                if !continue_after_failure(confirm, id, targets.len() - report.total()) {
                    report.aborted = true;
                    break;
                }
            }
        }
    }

    report.print_summary();
    Ok(report)
}

/// Remove duplicate remote agents for every step name in the document.
///
/// Agents the document is bound to are always kept, so no binding is left
/// pointing at a deleted duplicate.
pub async fn run_dedupe_sweep(
    registry: &AgentRegistry,
    store: &FlowStore,
    confirm: &dyn Confirm,
) -> Result<Vec<(String, DedupeReport)>> {
    let document = store.load()?;

    let mut names: Vec<String> = Vec::new();
    for step in document.steps() {
        let name = step.display_name().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    let bound: HashSet<String> = document
        .steps()
        .filter_map(StepNode::agent_id)
        .map(str::to_string)
        .collect();

    let mut reports = Vec::with_capacity(names.len());
    for name in names {
        let report = registry.dedupe_in_flow(&name, &bound, confirm).await?;
        if !report.deleted.is_empty() {
            log_info!("'{}': removed {} duplicate(s)", name, report.deleted.len());
        }
        if !report.declined.is_empty() {
            log_warning!("'{}': kept {} duplicate(s) on request", name, report.declined.len());
        }
        reports.push((name, report));
    }

    Ok(reports)
}

/// Push the local agent config of every provisioned step to its remote agent.
pub async fn run_push_updates(
    registry: &AgentRegistry,
    store: &FlowStore,
    confirm: &dyn Confirm,
) -> Result<BatchReport> {
    let document = store.load()?;
    let mut report = BatchReport::default();
    let targets: Vec<&StepNode> = document
        .steps()
        .filter(|s| s.provision_state() == ProvisionState::Provisioned)
        .collect();

    if targets.is_empty() {
        log_info!("No provisioned step to update");
        return Ok(report);
    }
    if !confirm.confirm(&ConfirmRequest::low(format!(
        "Push local agent configs for {} step(s)?",
        targets.len()
    ))) {
        report.aborted = true;
        return Ok(report);
    }

    for (index, step) in targets.iter().enumerate() {
        log_progress!(index + 1, targets.len(), "steps");
        match registry.push_update(step).await {
            Ok(_) => report.done(&step.id),
            Err(e) => {
                report.fail(&step.id, &e);
                if !continue_after_failure(confirm, &step.id, targets.len() - index - 1) {
                    report.aborted = true;
                    break;
                }
            }
        }
    }

    report.print_summary();
    Ok(report)
}

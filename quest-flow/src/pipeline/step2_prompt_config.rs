//! Stage 2: give every step a prompt config.
//!
//! Steps that already carry a non-empty `prompt_config` are left alone. For
//! the rest the completion service drafts one; if that fails the step gets the
//! deterministic [`PromptConfig::minimal`] so one bad reply never sinks the
//! batch.

use serde_json::Value;

use quest_flow_sdk::{
    log_document_saved, log_found, log_info, log_stage_complete, log_stage_header,
    log_stage_start, log_warning,
};

use crate::completion::{complete_json, CompletionClient};
use crate::config::AgentDefaults;
use crate::confirm::{Confirm, ConfirmRequest};
use crate::error::{PipelineError, Result};
use crate::flow::{FlowStore, PromptConfig, StepNode};
use crate::pipeline::batch::{continue_after_failure, execute_node, BatchReport, NodeContext};
use crate::pipeline::synthesized::Synthesized;

pub const STAGE: usize = 2;
pub const STAGE_NAME: &str = "Prompt Config Synthesizer";

const PROMPT_CONFIG_SYSTEM_PROMPT: &str = r#"You write behaviour specs for voice agents that talk with children.

Convert the step description you are given into a JSON object:
{
  "name": "<short title>",
  "role": "<persona and instructions for the agent, second person>",
  "first_message": "<what the agent says first>",
  "success_criteria": [{"id": "<snake_case>", "name": "...", "prompt": "<when is the goal met>"}],
  "data_fields": [{"identifier": "<snake_case>", "type": "string", "description": "..."}],
  "turn": {"turn_timeout_secs": 7, "max_duration_secs": 300}
}

Keep language simple and warm. Ask one question at a time.
Output only the JSON object."#;

/// True when the step has no prompt config or an empty one.
pub fn needs_prompt_config(step: &StepNode) -> bool {
    !step.has_prompt_config()
}

/// Natural-language description of a step sent to the completion service.
pub fn describe_step(step: &StepNode) -> String {
    let mut text = format!("Step: {}", step.display_name());
    if !step.description.trim().is_empty() {
        text.push_str("\nDescription: ");
        text.push_str(step.description.trim());
    }
    text
}

/// Ask the completion service for a prompt config.
pub async fn synthesize_prompt_config(
    client: &dyn CompletionClient,
    step: &StepNode,
) -> Result<PromptConfig> {
    let reply = complete_json(client, PROMPT_CONFIG_SYSTEM_PROMPT, &describe_step(step))
        .await
        .map_err(|e| e.for_node(&step.id))?;

    let Value::Object(map) = reply else {
        return Err(PipelineError::Generation {
            node: Some(step.id.clone()),
            message: "prompt config response is not a JSON object".to_string(),
        });
    };

    let mut config = PromptConfig::from_map(&map).map_err(|e| PipelineError::Generation {
        node: Some(step.id.clone()),
        message: e.to_string(),
    })?;

    if config.role.trim().is_empty() {
        return Err(PipelineError::Generation {
            node: Some(step.id.clone()),
            message: "prompt config has an empty role".to_string(),
        });
    }
    if config.name.trim().is_empty() {
        config.name = step.display_name().to_string();
    }
    Ok(config)
}

/// Model-drafted config, or the minimal one if the model failed.
pub async fn prompt_config_with_fallback(
    client: &dyn CompletionClient,
    step: &StepNode,
    defaults: &AgentDefaults,
) -> Synthesized<PromptConfig> {
    Synthesized::or_fallback(synthesize_prompt_config(client, step).await, || {
        PromptConfig::minimal(step, defaults)
    })
}

/// Run stage 2 over every step of the document at `store`.
pub async fn run_prompt_config_stage(
    client: &dyn CompletionClient,
    store: &FlowStore,
    defaults: &AgentDefaults,
    confirm: &dyn Confirm,
) -> Result<BatchReport> {
    log_stage_header!(
        STAGE,
        STAGE_NAME,
        "Draft a prompt config for every step that lacks one"
    );

    let mut document = store.load()?;
    let step_ids = document.step_ids();
    let pending: Vec<String> = document
        .steps()
        .filter(|s| needs_prompt_config(s))
        .map(|s| s.id.clone())
        .collect();

    let mut report = BatchReport::default();
    for id in step_ids.iter().filter(|id| !pending.contains(*id)) {
        report.skip(id, "prompt_config already present");
    }

    if pending.is_empty() {
        log_info!("Every step already has a prompt config");
        return Ok(report);
    }

    log_found!(pending.len(), "steps without a prompt config");
    if !confirm.confirm(&ConfirmRequest::low(format!(
        "Generate prompt configs for {} step(s)?",
        pending.len()
    ))) {
        report.aborted = true;
        return Ok(report);
    }

    log_stage_start!(STAGE, STAGE_NAME, pending.len());

    for (index, id) in pending.iter().enumerate() {
        let ctx = NodeContext {
            stage: STAGE,
            node_number: index + 1,
            total_nodes: pending.len(),
        };
        let Some(step) = document.step(id).cloned() else {
            continue;
        };

        let result = execute_node(ctx, id, step.display_name(), async {
            let outcome = prompt_config_with_fallback(client, &step, defaults).await;
            let summary = match outcome.cause() {
                Some(cause) => {
                    log_warning!("{}; using minimal prompt config", cause);
                    "minimal prompt config".to_string()
                }
                None => "prompt config generated".to_string(),
            };
            let map = outcome.into_value().to_map()?;
            Ok::<_, PipelineError>((map, summary))
        })
        .await;

        match result {
            Ok(map) => {
                if let Some(target) = document.step_mut(id) {
                    target.prompt_config = Some(map);
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

    log_document_saved!(STAGE, store.path().display(), "prompt configs");
    report.print_summary();
    log_stage_complete!(STAGE, STAGE_NAME);
    Ok(report)
}

//! Stage 3: turn prompt configs into platform-ready agent configs.
//!
//! Two strategies. `template` derives the config deterministically.
//! `model_assisted` asks the completion service for a platform-shaped object,
//! lays it over the template so missing fields keep their defaults, and falls
//! back to the template when the model fails. Either way the result passes
//! [`AgentConfig::check_structure`] before it is stored.

use serde_json::Value;

use quest_flow_sdk::{
    log_document_saved, log_found, log_info, log_stage_complete, log_stage_header,
    log_stage_start, log_warning,
};

use crate::completion::{complete_json, CompletionClient};
use crate::config::{AgentDefaults, SynthesisStrategy};
use crate::confirm::{Confirm, ConfirmRequest};
use crate::error::{PipelineError, Result};
use crate::flow::{AgentConfig, FlowStore, PromptConfig, StepNode};
use crate::pipeline::batch::{continue_after_failure, execute_node, BatchReport, NodeContext};
use crate::pipeline::synthesized::Synthesized;
use crate::utils::merge_json;

pub const STAGE: usize = 3;
pub const STAGE_NAME: &str = "Agent Config Synthesizer";

const AGENT_CONFIG_SYSTEM_PROMPT: &str = r#"You convert voice-agent behaviour specs into ElevenLabs Conversational AI agent definitions.

Return a JSON object with this shape (omit fields you have no opinion on):
{
  "conversation_config": {
    "agent": {"first_message": "...", "language": "en", "prompt": {"prompt": "...", "temperature": 0.5}},
    "tts": {"voice_id": "...", "stability": 0.5, "similarity_boost": 0.8},
    "turn": {"turn_timeout": 7},
    "conversation": {"max_duration_seconds": 300}
  },
  "platform_settings": {
    "evaluation": {"criteria": [{"id": "...", "name": "...", "type": "prompt", "conversation_goal_prompt": "..."}]},
    "data_collection": {"<identifier>": {"type": "string", "description": "..."}}
  }
}

Map success_criteria to evaluation criteria and data_fields to data_collection.
Use the voice_id from the behaviour spec when it has one.
Output only the JSON object."#;

/// True when the step has no agent config or an empty one.
pub fn needs_agent_config(step: &StepNode) -> bool {
    !step.has_agent_config()
}

fn prompt_config_of(step: &StepNode) -> Result<PromptConfig> {
    let map = step
        .prompt_config
        .as_ref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| PipelineError::Validation {
            node: Some(step.id.clone()),
            message: "step has no prompt_config; run the prompt config stage first".to_string(),
        })?;
    PromptConfig::from_map(map).map_err(|e| e.for_node(&step.id))
}

/// Deterministic agent config for a step with a prompt config.
pub fn template_agent_config(step: &StepNode, defaults: &AgentDefaults) -> Result<AgentConfig> {
    let prompt = prompt_config_of(step)?;
    let mut config = AgentConfig::from_prompt_config(&prompt, defaults);
    finish(&mut config, step, &prompt, defaults)?;
    Ok(config)
}

/// Ask the completion service for an agent config, layered over the template.
pub async fn model_assisted_agent_config(
    client: &dyn CompletionClient,
    step: &StepNode,
    defaults: &AgentDefaults,
) -> Result<AgentConfig> {
    let prompt = prompt_config_of(step)?;
    let user = format!(
        "# Behaviour spec\n\n{}",
        serde_json::to_string_pretty(&prompt)?
    );

    let reply = complete_json(client, AGENT_CONFIG_SYSTEM_PROMPT, &user)
        .await
        .map_err(|e| e.for_node(&step.id))?;
    if !reply.is_object() {
        return Err(PipelineError::Generation {
            node: Some(step.id.clone()),
            message: "agent config response is not a JSON object".to_string(),
        });
    }

    let mut merged = Value::Object(AgentConfig::from_prompt_config(&prompt, defaults).to_map()?);
    merge_json(&mut merged, reply);

    let mut config: AgentConfig =
        serde_json::from_value(merged).map_err(|e| PipelineError::Generation {
            node: Some(step.id.clone()),
            message: format!("agent config does not match the platform shape: {}", e),
        })?;

    finish(&mut config, step, &prompt, defaults).map_err(|e| match e {
        PipelineError::Validation { node, message } => PipelineError::Generation { node, message },
        other => other,
    })?;
    Ok(config)
}

/// Name the agent after the step, fill gaps, check the result.
fn finish(
    config: &mut AgentConfig,
    step: &StepNode,
    prompt: &PromptConfig,
    defaults: &AgentDefaults,
) -> Result<()> {
    config.name = step.display_name().to_string();
    config.fill_gaps(step.display_name(), Some(prompt), defaults);
    config.check_structure().map_err(|e| e.for_node(&step.id))
}

/// Produce an agent config with the configured strategy.
///
/// `client` may be `None` only for the template strategy; model-assisted
/// synthesis without a client falls back to the template.
pub async fn synthesize_agent_config(
    client: Option<&dyn CompletionClient>,
    step: &StepNode,
    strategy: SynthesisStrategy,
    defaults: &AgentDefaults,
) -> Result<Synthesized<AgentConfig>> {
    // no prompt config is an error for both strategies, never a fallback
    prompt_config_of(step)?;

    match (strategy, client) {
        (SynthesisStrategy::Template, _) => {
            Ok(Synthesized::Primary(template_agent_config(step, defaults)?))
        }
        (SynthesisStrategy::ModelAssisted, Some(client)) => {
            let primary = model_assisted_agent_config(client, step, defaults).await;
            Synthesized::or_try_fallback(primary, || template_agent_config(step, defaults))
        }
        (SynthesisStrategy::ModelAssisted, None) => Synthesized::or_try_fallback(
            Err(PipelineError::Config(
                "no completion client configured".to_string(),
            )),
            || template_agent_config(step, defaults),
        ),
    }
}

/// Run stage 3 over every step of the document at `store`.
pub async fn run_agent_config_stage(
    client: Option<&dyn CompletionClient>,
    store: &FlowStore,
    strategy: SynthesisStrategy,
    defaults: &AgentDefaults,
    confirm: &dyn Confirm,
) -> Result<BatchReport> {
    log_stage_header!(
        STAGE,
        STAGE_NAME,
        "Convert prompt configs into platform-ready agent configs"
    );

    let mut document = store.load()?;
    let mut report = BatchReport::default();
    let mut pending: Vec<String> = Vec::new();

    for step in document.steps() {
        if !needs_agent_config(step) {
            report.skip(&step.id, "elevenlabs_config already present");
        } else if let Err(e) = prompt_config_of(step) {
            report.skip(&step.id, e.to_string());
        } else {
            pending.push(step.id.clone());
        }
    }

    if pending.is_empty() {
        log_info!("No step needs an agent config");
        return Ok(report);
    }

    log_found!(pending.len(), "steps without an agent config");
    if !confirm.confirm(&ConfirmRequest::low(format!(
        "Build agent configs for {} step(s) using the {:?} strategy?",
        pending.len(),
        strategy
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
            let outcome = synthesize_agent_config(client, &step, strategy, defaults).await?;
            let summary = match outcome.cause() {
                Some(cause) => {
                    log_warning!("{}; using template agent config", cause);
                    "template agent config (fallback)".to_string()
                }
                None => format!("agent config built ({:?})", strategy),
            };
            let map = outcome.into_value().to_map()?;
            Ok::<_, PipelineError>((map, summary))
        })
        .await;

        match result {
            Ok(map) => {
                if let Some(target) = document.step_mut(id) {
                    target.elevenlabs_config = Some(map);
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

    log_document_saved!(STAGE, store.path().display(), "agent configs");
    report.print_summary();
    log_stage_complete!(STAGE, STAGE_NAME);
    Ok(report)
}

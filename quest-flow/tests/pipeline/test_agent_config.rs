//! Tests for stage 3: agent config synthesis

use super::common::*;
use serde_json::json;

use quest_flow::config::{AgentDefaults, SynthesisStrategy};
use quest_flow::flow::{AgentConfig, StepNode};
use quest_flow::pipeline::{needs_agent_config, run_agent_config_stage, synthesize_agent_config};
use quest_flow::PipelineError;

fn step_with_prompt(id: &str, name: &str) -> StepNode {
    let mut step = StepNode::new(id, name);
    step.prompt_config = prompt_config_json(name).as_object().cloned();
    step
}

#[tokio::test]
async fn test_model_output_overlays_template() {
    let client = ScriptedCompletion::new().reply_json(json!({
        "conversation_config": {
            "agent": {"first_message": "Hello, explorer!"},
            "tts": {"voice_id": "voice-from-model"}
        }
    }));
    let step = step_with_prompt("genre", "Genre");

    let outcome = synthesize_agent_config(
        Some(&client),
        &step,
        SynthesisStrategy::ModelAssisted,
        &AgentDefaults::default(),
    )
    .await
    .unwrap();

    assert!(!outcome.is_fallback());
    let config = outcome.value();
    assert_eq!(config.name, "Genre");
    assert_eq!(config.conversation_config.agent.first_message, "Hello, explorer!");
    assert_eq!(config.conversation_config.tts.voice_id, "voice-from-model");
    // untouched by the model, kept from the template
    assert_eq!(
        config.conversation_config.agent.prompt.prompt,
        "You help the child choose a genre."
    );
    assert!(config.platform_settings.data_collection.contains_key("choice"));
}

#[tokio::test]
async fn test_model_name_is_replaced_by_step_name() {
    let client = ScriptedCompletion::new().reply_json(json!({"name": "Genre Agent v2"}));
    let outcome = synthesize_agent_config(
        Some(&client),
        &step_with_prompt("genre", "Genre"),
        SynthesisStrategy::ModelAssisted,
        &AgentDefaults::default(),
    )
    .await
    .unwrap();
    assert_eq!(outcome.value().name, "Genre");
}

#[tokio::test]
async fn test_bad_model_output_falls_back_to_template() {
    let client = ScriptedCompletion::new().reply_json(json!({
        "platform_settings": {
            "data_collection": {"choice": {"type": "colour", "description": "?"}}
        }
    }));
    let step = step_with_prompt("genre", "Genre");
    let defaults = AgentDefaults::default();

    let outcome = synthesize_agent_config(Some(&client), &step, SynthesisStrategy::ModelAssisted, &defaults)
        .await
        .unwrap();

    assert!(outcome.is_fallback());
    assert!(outcome.cause().unwrap().to_string().contains("colour"));
    let template = synthesize_agent_config(None, &step, SynthesisStrategy::Template, &defaults)
        .await
        .unwrap();
    assert_eq!(outcome.value(), template.value());
}

#[tokio::test]
async fn test_missing_prompt_config_is_not_a_fallback() {
    let client = ScriptedCompletion::new();
    let err = synthesize_agent_config(
        Some(&client),
        &StepNode::new("genre", "Genre"),
        SynthesisStrategy::ModelAssisted,
        &AgentDefaults::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::Validation { .. }));
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn test_template_stage_writes_checked_configs() {
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = flow_with_prompt_configs();
    // setting has no prompt config yet
    nodes[3].as_object_mut().unwrap().remove("prompt_config");
    let store = write_flow(dir.path(), "quiz.json", &nodes);

    let report = run_agent_config_stage(
        None,
        &store,
        SynthesisStrategy::Template,
        &AgentDefaults::default(),
        &ScriptedConfirm::always(true),
    )
    .await
    .unwrap();

    assert_eq!(report.done, vec!["genre", "length"]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "setting");
    assert!(report.skipped[0].1.contains("prompt_config"));

    let document = store.load().unwrap();
    for id in ["genre", "length"] {
        let step = document.step(id).unwrap();
        assert!(!needs_agent_config(step));
        let config = AgentConfig::from_stored(step.elevenlabs_config.as_ref().unwrap()).unwrap();
        config.check_structure().unwrap();
        assert_eq!(config.name, step.display_name());
    }
    assert!(needs_agent_config(document.step("setting").unwrap()));
}

#[tokio::test]
async fn test_rerun_skips_configured_steps() {
    let dir = tempfile::tempdir().unwrap();
    let store = write_flow(dir.path(), "quiz.json", &flow_with_prompt_configs());
    let confirm = ScriptedConfirm::always(true);
    let defaults = AgentDefaults::default();

    run_agent_config_stage(None, &store, SynthesisStrategy::Template, &defaults, &confirm)
        .await
        .unwrap();
    let first = std::fs::read_to_string(store.path()).unwrap();

    let report = run_agent_config_stage(None, &store, SynthesisStrategy::Template, &defaults, &confirm)
        .await
        .unwrap();
    assert!(report.done.is_empty());
    assert_eq!(report.skipped.len(), 3);
    assert_eq!(std::fs::read_to_string(store.path()).unwrap(), first);
}

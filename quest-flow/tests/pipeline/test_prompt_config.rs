//! Tests for stage 2: prompt config synthesis

use super::common::*;
use serde_json::json;

use quest_flow::config::AgentDefaults;
use quest_flow::flow::{PromptConfig, StepNode};
use quest_flow::pipeline::step2_prompt_config::prompt_config_with_fallback;
use quest_flow::pipeline::{run_prompt_config_stage, synthesize_prompt_config};
use quest_flow::PipelineError;

#[tokio::test]
async fn test_synthesize_fills_missing_name() {
    let mut reply = prompt_config_json("Genre");
    reply["name"] = json!("");
    let client = ScriptedCompletion::new().reply_json(reply);

    let mut step = StepNode::new("genre", "Genre");
    step.description = "Pick a genre".to_string();
    let config = synthesize_prompt_config(&client, &step).await.unwrap();

    assert_eq!(config.name, "Genre");
    assert_eq!(config.data_fields[0].identifier, "choice");
    let sent = client.prompts.lock().unwrap()[0].clone();
    assert_eq!(sent, "Step: Genre\nDescription: Pick a genre");
}

#[tokio::test]
async fn test_synthesize_rejects_array() {
    let client = ScriptedCompletion::new().reply_json(json!([1, 2]));
    let err = synthesize_prompt_config(&client, &StepNode::new("genre", "Genre"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Generation { node: Some(ref n), .. } if n == "genre"));
}

#[tokio::test]
async fn test_fallback_is_minimal_config() {
    let client = ScriptedCompletion::new().fail("timeout");
    let step = StepNode::new("genre", "Genre");
    let defaults = AgentDefaults::default();

    let outcome = prompt_config_with_fallback(&client, &step, &defaults).await;

    assert!(outcome.is_fallback());
    assert!(outcome.cause().unwrap().to_string().contains("timeout"));
    assert_eq!(outcome.value(), &PromptConfig::minimal(&step, &defaults));
}

#[tokio::test]
async fn test_stage_mixes_generated_and_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let store = write_flow(dir.path(), "quiz.json", &story_flow());
    let client = ScriptedCompletion::new()
        .reply_json(prompt_config_json("Genre"))
        .fail("rate limited")
        .reply_json(json!("not an object"));
    let confirm = ScriptedConfirm::always(true);

    let report = run_prompt_config_stage(&client, &store, &AgentDefaults::default(), &confirm)
        .await
        .unwrap();

    assert_eq!(report.done, vec!["genre", "length", "setting"]);
    assert!(!report.has_failures());

    let document = store.load().unwrap();
    let genre = PromptConfig::from_map(document.step("genre").unwrap().prompt_config.as_ref().unwrap()).unwrap();
    assert_eq!(genre.role, "You help the child choose a genre.");

    let length = PromptConfig::from_map(document.step("length").unwrap().prompt_config.as_ref().unwrap()).unwrap();
    assert_eq!(length.name, "Length");
    assert_eq!(length.voice_id.as_deref(), Some(AgentDefaults::default().voice_id.as_str()));

    // one up-front question, nothing else
    assert_eq!(confirm.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_stage_skips_configured_steps() {
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = story_flow();
    nodes[1]["prompt_config"] = prompt_config_json("Genre");
    nodes[2]["prompt_config"] = json!({});
    let store = write_flow(dir.path(), "quiz.json", &nodes);

    let client = ScriptedCompletion::new()
        .reply_json(prompt_config_json("Length"))
        .reply_json(prompt_config_json("Setting"));
    let report = run_prompt_config_stage(
        &client,
        &store,
        &AgentDefaults::default(),
        &ScriptedConfirm::always(true),
    )
    .await
    .unwrap();

    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "genre");
    assert_eq!(report.done, vec!["length", "setting"]);
    assert_eq!(client.calls(), 2);
}

#[tokio::test]
async fn test_stage_declined_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = write_flow(dir.path(), "quiz.json", &story_flow());
    let before = std::fs::read_to_string(store.path()).unwrap();

    let client = ScriptedCompletion::new();
    let report = run_prompt_config_stage(
        &client,
        &store,
        &AgentDefaults::default(),
        &ScriptedConfirm::always(false),
    )
    .await
    .unwrap();

    assert!(report.aborted);
    assert_eq!(client.calls(), 0);
    assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
}

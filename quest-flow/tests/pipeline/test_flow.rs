//! Tests for stage 1: flow generation

use super::common::*;
use serde_json::json;

use quest_flow::flow::{FlowNode, FlowStore};
use quest_flow::pipeline::{generate_flow, run_flow_stage};
use quest_flow::{PipelineError, StoreError};

#[tokio::test]
async fn test_generate_flow_from_wrapped_array() {
    let client = ScriptedCompletion::new().reply_json(json!({"nodes": story_flow()}));

    let nodes = generate_flow(&client, "Ask about genre, length and setting.")
        .await
        .unwrap();

    assert_eq!(nodes.len(), 4);
    assert!(matches!(nodes[0], FlowNode::Group(_)));
    let ids: Vec<_> = nodes.iter().map(|n| n.id()).collect();
    assert_eq!(ids, vec!["group-preferences", "genre", "length", "setting"]);
    assert_eq!(client.calls(), 1);
}

#[tokio::test]
async fn test_generate_flow_accepts_fenced_reply() {
    let reply = format!("```json\n{}\n```", story_flow());
    let client = ScriptedCompletion::new().reply(reply);
    let nodes = generate_flow(&client, "outline").await.unwrap();
    assert_eq!(nodes.len(), 4);
}

#[tokio::test]
async fn test_generate_flow_rejects_non_array() {
    let client = ScriptedCompletion::new().reply_json(json!({"title": "Quiz"}));
    let err = generate_flow(&client, "outline").await.unwrap_err();
    assert!(matches!(err, PipelineError::Generation { .. }));
}

#[tokio::test]
async fn test_generate_flow_rejects_invalid_json() {
    let client = ScriptedCompletion::new().reply("Sure! Here is your quiz.");
    let err = generate_flow(&client, "outline").await.unwrap_err();
    assert!(err.to_string().contains("not valid JSON"));
}

#[tokio::test]
async fn test_generate_flow_rejects_cycle() {
    let client = ScriptedCompletion::new().reply_json(json!([
        {"id": "a", "name": "A", "dependsOn": ["b"]},
        {"id": "b", "name": "B", "dependsOn": ["a"]}
    ]));
    let err = generate_flow(&client, "outline").await.unwrap_err();
    match err {
        PipelineError::Generation { message, .. } => {
            assert!(message.contains("a, b"), "message: {}", message)
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_generate_flow_rejects_unknown_reference() {
    let client = ScriptedCompletion::new().reply_json(json!([
        {"id": "genre", "name": "Genre", "dependsOn": ["mood"]}
    ]));
    let err = generate_flow(&client, "outline").await.unwrap_err();
    assert!(err.to_string().contains("mood"));
}

#[tokio::test]
async fn test_empty_outline_makes_no_call() {
    let client = ScriptedCompletion::new();
    assert!(generate_flow(&client, "   \n").await.is_err());
    assert_eq!(client.calls(), 0);
}

#[tokio::test]
async fn test_run_flow_stage_writes_document() {
    let dir = tempfile::tempdir().unwrap();
    let outline = dir.path().join("quiz.md");
    std::fs::write(&outline, "# Story quiz\n- genre\n- length\n").unwrap();
    let store = FlowStore::new(dir.path().join("quiz.json"));

    let client = ScriptedCompletion::new().reply_json(json!({"nodes": story_flow()}));
    let confirm = ScriptedConfirm::always(false);

    let document = run_flow_stage(&client, &outline, &store, &confirm)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(document.step_ids(), vec!["genre", "length", "setting"]);
    assert_eq!(read_nodes(&store), document.nodes);
    // no document existed, so nothing was asked
    assert!(confirm.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_run_flow_stage_keeps_existing_when_declined() {
    let dir = tempfile::tempdir().unwrap();
    let outline = dir.path().join("quiz.md");
    std::fs::write(&outline, "outline").unwrap();
    let store = write_flow(dir.path(), "quiz.json", &story_flow());
    let before = std::fs::read_to_string(store.path()).unwrap();

    let client = ScriptedCompletion::new();
    let confirm = ScriptedConfirm::always(false);

    let result = run_flow_stage(&client, &outline, &store, &confirm).await.unwrap();

    assert!(result.is_none());
    assert_eq!(client.calls(), 0);
    assert_eq!(confirm.destructive_count(), 1);
    assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
}

#[tokio::test]
async fn test_run_flow_stage_missing_outline() {
    let dir = tempfile::tempdir().unwrap();
    let store = FlowStore::new(dir.path().join("quiz.json"));
    let err = run_flow_stage(
        &ScriptedCompletion::new(),
        &dir.path().join("missing.md"),
        &store,
        &ScriptedConfirm::always(true),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::Store(StoreError::Missing(_))));
}

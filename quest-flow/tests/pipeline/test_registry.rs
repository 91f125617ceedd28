//! Tests for stage 4: agent registry and sync

use super::common::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use quest_flow::config::{AgentDefaults, SyncPolicy, SynthesisStrategy};
use quest_flow::flow::{AgentConfig, FlowNode, FlowStore, ProvisionState, StepNode};
use quest_flow::pipeline::{
    run_agent_config_stage, run_assemble_stage, run_clear, run_dedupe_sweep, run_push_updates,
    run_sync_stage, SyncOptions,
};
use quest_flow::registry::{AgentRegistry, ClearOutcome, ProvisionOutcome};
use quest_flow_sdk::RemoteChange;

fn configured_step(id: &str, name: &str) -> StepNode {
    let mut step = StepNode::new(id, name);
    step.prompt_config = prompt_config_json(name).as_object().cloned();
    let prompt = quest_flow::flow::PromptConfig::from_map(step.prompt_config.as_ref().unwrap()).unwrap();
    let mut config = AgentConfig::from_prompt_config(&prompt, &AgentDefaults::default());
    config.name = name.to_string();
    step.elevenlabs_config = Some(config.to_map().unwrap());
    step
}

fn registry(platform: &Arc<InMemoryPlatform>) -> AgentRegistry {
    AgentRegistry::new(platform.clone(), 2)
}

fn no_delay(policy: SyncPolicy) -> SyncOptions {
    SyncOptions {
        policy,
        create_delay: Duration::ZERO,
    }
}

/// Flow document made of the given steps.
fn flow_of(steps: Vec<StepNode>) -> Value {
    Value::Array(
        steps
            .into_iter()
            .map(|step| serde_json::to_value(FlowNode::Step(step)).unwrap())
            .collect(),
    )
}

fn bound_step(id: &str, name: &str, agent_id: &str) -> StepNode {
    let mut step = configured_step(id, name);
    step.bind_agent(agent_id, chrono::Utc::now());
    step
}

/// Flow whose steps all carry template agent configs.
async fn configured_flow(dir: &std::path::Path) -> FlowStore {
    let store = write_flow(dir, "quiz.json", &flow_with_prompt_configs());
    run_agent_config_stage(
        None,
        &store,
        SynthesisStrategy::Template,
        &AgentDefaults::default(),
        &ScriptedConfirm::always(true),
    )
    .await
    .unwrap();
    store
}

// ============================================================================
// provision
// ============================================================================

#[tokio::test]
async fn test_provision_creates_and_binds() {
    let platform = Arc::new(InMemoryPlatform::new());
    let mut step = configured_step("genre", "Genre");

    let outcome = registry(&platform)
        .provision(&mut step, SyncPolicy::Replace, &ScriptedConfirm::always(true))
        .await
        .unwrap();

    assert!(outcome.created());
    assert_eq!(step.agent_id(), Some("agent_1"));
    assert_eq!(step.provision_state(), ProvisionState::Provisioned);
    let created_at = step.elevenlabs_config.as_ref().unwrap()["created_at"].as_str().unwrap();
    assert!(created_at.starts_with("2023-11-14"));

    // the platform received the config without binding keys
    let (_, sent) = platform.configs.lock().unwrap()[0].clone();
    assert_eq!(sent["name"], "Genre");
    assert!(sent.get("agent_id").is_none());
}

#[tokio::test]
async fn test_provision_twice_is_stable() {
    let platform = Arc::new(InMemoryPlatform::new());
    let registry = registry(&platform);
    let confirm = ScriptedConfirm::always(true);
    let mut step = configured_step("genre", "Genre");

    registry.provision(&mut step, SyncPolicy::Replace, &confirm).await.unwrap();
    let second = registry.provision(&mut step, SyncPolicy::Replace, &confirm).await.unwrap();

    assert_eq!(
        second,
        ProvisionOutcome::AlreadyProvisioned {
            agent_id: "agent_1".to_string()
        }
    );
    assert_eq!(platform.count_named("Genre"), 1);
}

#[tokio::test]
async fn test_replace_policy_deletes_existing() {
    let platform = Arc::new(
        InMemoryPlatform::new()
            .with_agent("old_1", "Genre", 100)
            .with_agent("old_2", "Genre", 200)
            .with_agent("other", "Length", 150),
    );
    let confirm = ScriptedConfirm::always(true);
    let mut step = configured_step("genre", "Genre");

    let outcome = registry(&platform)
        .provision(&mut step, SyncPolicy::Replace, &confirm)
        .await
        .unwrap();

    match outcome {
        ProvisionOutcome::Provisioned { change, removed, .. } => {
            assert_eq!(change, RemoteChange::Created);
            assert_eq!(removed, vec!["old_2", "old_1"]);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(platform.count_named("Genre"), 1);
    assert!(platform.ids().contains(&"other".to_string()));
    assert_eq!(confirm.destructive_count(), 1);
}

#[tokio::test]
async fn test_replace_declined_changes_nothing() {
    let platform = Arc::new(InMemoryPlatform::new().with_agent("old_1", "Genre", 100));
    let mut step = configured_step("genre", "Genre");

    let outcome = registry(&platform)
        .provision(&mut step, SyncPolicy::Replace, &ScriptedConfirm::always(false))
        .await
        .unwrap();

    assert_eq!(outcome, ProvisionOutcome::Declined);
    assert_eq!(platform.ids(), vec!["old_1"]);
    assert_eq!(step.provision_state(), ProvisionState::Unprovisioned);
}

#[tokio::test]
async fn test_update_policy_patches_newest() {
    let platform = Arc::new(
        InMemoryPlatform::new()
            .with_agent("old_1", "Genre", 100)
            .with_agent("old_2", "Genre", 300)
            .with_agent("old_3", "Genre", 200),
    );
    let mut step = configured_step("genre", "Genre");

    let outcome = registry(&platform)
        .provision(&mut step, SyncPolicy::Update, &ScriptedConfirm::always(true))
        .await
        .unwrap();

    match outcome {
        ProvisionOutcome::Provisioned {
            agent_id,
            change,
            removed,
        } => {
            assert_eq!(agent_id, "old_2");
            assert_eq!(change, RemoteChange::Updated);
            assert_eq!(removed, vec!["old_3", "old_1"]);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(platform.ids(), vec!["old_2"]);
    assert_eq!(platform.patches.lock().unwrap()[0].0, "old_2");
    assert_eq!(step.agent_id(), Some("old_2"));
}

#[tokio::test]
async fn test_skip_policy_adopts_newest() {
    let platform = Arc::new(
        InMemoryPlatform::new()
            .with_agent("old_1", "Genre", 100)
            .with_agent("old_2", "Genre", 300),
    );
    let confirm = ScriptedConfirm::always(true);
    let mut step = configured_step("genre", "Genre");

    registry(&platform)
        .provision(&mut step, SyncPolicy::Skip, &confirm)
        .await
        .unwrap();

    assert_eq!(step.agent_id(), Some("old_2"));
    assert_eq!(platform.ids().len(), 2);
    assert!(platform.configs.lock().unwrap().is_empty());
    assert_eq!(confirm.destructive_count(), 0);
}

#[tokio::test]
async fn test_stale_binding_is_reprovisioned() {
    let platform = Arc::new(InMemoryPlatform::new());
    let mut step = configured_step("genre", "Genre");
    step.bind_agent("vanished", chrono::Utc::now());

    let outcome = registry(&platform)
        .provision(&mut step, SyncPolicy::Replace, &ScriptedConfirm::always(true))
        .await
        .unwrap();

    assert!(outcome.created());
    assert_eq!(step.agent_id(), Some("agent_1"));
}

#[tokio::test]
async fn test_provision_rejects_broken_config() {
    let platform = Arc::new(InMemoryPlatform::new());
    let mut step = StepNode::new("genre", "Genre");
    step.elevenlabs_config = json!({"name": "Genre"}).as_object().cloned();

    let err = registry(&platform)
        .provision(&mut step, SyncPolicy::Replace, &ScriptedConfirm::always(true))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("genre"));
    assert!(err.to_string().contains("conversation_config"));
    assert!(platform.ids().is_empty());
}

// ============================================================================
// clear / state machine
// ============================================================================

#[tokio::test]
async fn test_clear_then_provision_again() {
    let platform = Arc::new(InMemoryPlatform::new());
    let registry = registry(&platform);
    let confirm = ScriptedConfirm::always(true);
    let mut step = configured_step("genre", "Genre");

    registry.provision(&mut step, SyncPolicy::Replace, &confirm).await.unwrap();
    let cleared = registry.clear(&mut step, true, &confirm).await.unwrap();
    assert!(matches!(cleared, ClearOutcome::Cleared { ref agent_id, .. } if agent_id == "agent_1"));
    assert_eq!(step.provision_state(), ProvisionState::Cleared);
    assert!(step.has_agent_config());
    assert!(platform.ids().is_empty());

    registry.provision(&mut step, SyncPolicy::Replace, &confirm).await.unwrap();
    assert_eq!(step.provision_state(), ProvisionState::Provisioned);
    assert_eq!(step.agent_id(), Some("agent_2"));
}

#[tokio::test]
async fn test_clear_declined_keeps_binding() {
    let platform = Arc::new(InMemoryPlatform::new());
    let registry = registry(&platform);
    let mut step = configured_step("genre", "Genre");
    registry
        .provision(&mut step, SyncPolicy::Replace, &ScriptedConfirm::always(true))
        .await
        .unwrap();

    let outcome = registry
        .clear(&mut step, true, &ScriptedConfirm::always(false))
        .await
        .unwrap();

    assert_eq!(outcome, ClearOutcome::Declined);
    assert_eq!(step.agent_id(), Some("agent_1"));
    assert_eq!(platform.ids(), vec!["agent_1"]);
}

// ============================================================================
// sync stage and sweeps
// ============================================================================

#[tokio::test]
async fn test_sync_stage_provisions_every_step() {
    let dir = tempfile::tempdir().unwrap();
    let store = configured_flow(dir.path()).await;
    let platform = Arc::new(InMemoryPlatform::new());

    let report = run_sync_stage(
        &registry(&platform),
        &store,
        no_delay(SyncPolicy::Replace),
        &ScriptedConfirm::always(true),
    )
    .await
    .unwrap();

    assert_eq!(report.done, vec!["genre", "length", "setting"]);
    let document = store.load().unwrap();
    for step in document.steps() {
        assert_eq!(step.provision_state(), ProvisionState::Provisioned);
    }

    // second run touches nothing
    let again = run_sync_stage(
        &registry(&platform),
        &store,
        no_delay(SyncPolicy::Replace),
        &ScriptedConfirm::always(true),
    )
    .await
    .unwrap();
    assert!(again.done.is_empty());
    assert_eq!(again.skipped.len(), 3);
    assert_eq!(platform.ids().len(), 3);
}

#[tokio::test]
async fn test_sync_stage_per_node_decline() {
    let dir = tempfile::tempdir().unwrap();
    let store = configured_flow(dir.path()).await;
    let platform = Arc::new(InMemoryPlatform::new());

    // yes for genre, no for length, yes for setting
    let confirm = ScriptedConfirm::answers(&[true, false, true], true);
    let report = run_sync_stage(&registry(&platform), &store, no_delay(SyncPolicy::Replace), &confirm)
        .await
        .unwrap();

    assert_eq!(report.done, vec!["genre", "setting"]);
    assert_eq!(report.skipped[0].0, "length");
    let document = store.load().unwrap();
    assert_eq!(
        document.step("length").unwrap().provision_state(),
        ProvisionState::Unprovisioned
    );
}

#[tokio::test(start_paused = true)]
async fn test_sync_stage_waits_between_creates() {
    let dir = tempfile::tempdir().unwrap();
    let store = configured_flow(dir.path()).await;
    let platform = Arc::new(InMemoryPlatform::new());
    let options = SyncOptions {
        policy: SyncPolicy::Replace,
        create_delay: Duration::from_secs(5),
    };

    let started = tokio::time::Instant::now();
    run_sync_stage(&registry(&platform), &store, options, &ScriptedConfirm::always(true))
        .await
        .unwrap();

    // no pause before the first create, one before each of the other two
    assert_eq!(started.elapsed(), Duration::from_secs(10));
}

#[tokio::test]
async fn test_sync_failure_asks_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = flow_with_prompt_configs();
    for node in nodes.as_array_mut().unwrap().iter_mut().skip(1) {
        let name = node["name"].clone();
        node["elevenlabs_config"] = json!({ "name": name });
    }
    let store = write_flow(dir.path(), "quiz.json", &nodes);
    let platform = Arc::new(InMemoryPlatform::new());

    // node confirm yes, then "continue?" no
    let confirm = ScriptedConfirm::answers(&[true, false], true);
    let report = run_sync_stage(&registry(&platform), &store, no_delay(SyncPolicy::Replace), &confirm)
        .await
        .unwrap();

    assert!(report.aborted);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "genre");
    assert!(platform.ids().is_empty());
}

#[tokio::test]
async fn test_clear_sweep_single_step() {
    let dir = tempfile::tempdir().unwrap();
    let store = configured_flow(dir.path()).await;
    let platform = Arc::new(InMemoryPlatform::new());
    let confirm = ScriptedConfirm::always(true);
    run_sync_stage(&registry(&platform), &store, no_delay(SyncPolicy::Replace), &confirm)
        .await
        .unwrap();

    let report = run_clear(&registry(&platform), &store, Some("length"), false, &confirm)
        .await
        .unwrap();

    assert_eq!(report.done, vec!["length"]);
    let document = store.load().unwrap();
    assert_eq!(
        document.step("length").unwrap().provision_state(),
        ProvisionState::Cleared
    );
    assert_eq!(
        document.step("genre").unwrap().provision_state(),
        ProvisionState::Provisioned
    );
    // no teardown: remote agent still there
    assert_eq!(platform.ids().len(), 3);

    let err = run_clear(&registry(&platform), &store, Some("mood"), false, &confirm)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("mood"));
}

#[tokio::test]
async fn test_dedupe_sweep_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = write_flow(dir.path(), "quiz.json", &story_flow());
    let platform = Arc::new(
        InMemoryPlatform::new()
            .with_agent("g1", "Genre", 100)
            .with_agent("g2", "Genre", 300)
            .with_agent("l1", "Length", 100)
            .with_agent("x1", "Unrelated", 100)
            .with_agent("x2", "Unrelated", 200),
    );
    let confirm = ScriptedConfirm::always(true);

    let first = run_dedupe_sweep(&registry(&platform), &store, &confirm).await.unwrap();
    let deleted: Vec<&String> = first.iter().flat_map(|(_, r)| &r.deleted).collect();
    assert_eq!(deleted, vec!["g1"]);

    let second = run_dedupe_sweep(&registry(&platform), &store, &confirm).await.unwrap();
    assert!(second.iter().all(|(_, r)| r.deleted.is_empty()));
    assert_eq!(platform.ids(), vec!["g2", "l1", "x1", "x2"]);
}

#[tokio::test]
async fn test_push_updates_sends_local_config() {
    let dir = tempfile::tempdir().unwrap();
    let store = configured_flow(dir.path()).await;
    let platform = Arc::new(InMemoryPlatform::new());
    let confirm = ScriptedConfirm::always(true);
    run_sync_stage(&registry(&platform), &store, no_delay(SyncPolicy::Replace), &confirm)
        .await
        .unwrap();

    let mut document = store.load().unwrap();
    let config = document.step_mut("genre").unwrap().elevenlabs_config.as_mut().unwrap();
    config["conversation_config"]["agent"]["first_message"] = json!("Edited greeting");
    store.save(&mut document).unwrap();

    let report = run_push_updates(&registry(&platform), &store, &confirm).await.unwrap();
    assert_eq!(report.done.len(), 3);

    let patches = platform.patches.lock().unwrap();
    let (agent_id, patch): &(String, Value) = &patches[0];
    assert_eq!(Some(agent_id.as_str()), store.load().unwrap().step("genre").unwrap().agent_id());
    assert_eq!(
        patch["conversation_config"]["agent"]["first_message"],
        "Edited greeting"
    );
    assert!(patch.get("agent_id").is_none());
}

#[tokio::test]
async fn test_sync_stage_without_agent_configs_provisions_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = write_flow(dir.path(), "quiz.json", &story_flow());
    let platform = Arc::new(InMemoryPlatform::new());

    let report = run_sync_stage(
        &registry(&platform),
        &store,
        no_delay(SyncPolicy::Replace),
        &ScriptedConfirm::always(true),
    )
    .await
    .unwrap();

    assert!(report.done.is_empty());
    assert_eq!(report.skipped.len(), 3);
    assert!(report.skipped.iter().all(|(_, reason)| reason.contains("agent config")));
    assert!(platform.ids().is_empty());
}

// ============================================================================
// steps sharing a display name
// ============================================================================

async fn sync_same_named_steps(policy: SyncPolicy) -> (Arc<InMemoryPlatform>, FlowStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = write_flow(
        dir.path(),
        "quiz.json",
        &flow_of(vec![
            configured_step("hero-name", "Name"),
            configured_step("pet-name", "Name"),
        ]),
    );
    let platform = Arc::new(InMemoryPlatform::new());

    let report = run_sync_stage(
        &registry(&platform),
        &store,
        no_delay(policy),
        &ScriptedConfirm::always(true),
    )
    .await
    .unwrap();
    assert_eq!(report.done, vec!["hero-name", "pet-name"]);
    (platform, store, dir)
}

#[tokio::test]
async fn test_replace_keeps_agent_of_step_with_same_name() {
    let (platform, store, _dir) = sync_same_named_steps(SyncPolicy::Replace).await;

    let document = store.load().unwrap();
    let hero = document.step("hero-name").unwrap().agent_id().unwrap().to_string();
    let pet = document.step("pet-name").unwrap().agent_id().unwrap().to_string();
    assert_ne!(hero, pet);
    assert_eq!(platform.count_named("Name"), 2);

    let (_, workflow) = run_assemble_stage(&store, None).unwrap();
    let live = platform.ids();
    for step in workflow.sections.iter().flat_map(|s| &s.steps) {
        assert!(live.contains(&step.agent_id), "{} is not live", step.agent_id);
    }
}

#[tokio::test]
async fn test_skip_policy_does_not_share_agents_between_steps() {
    let (platform, store, _dir) = sync_same_named_steps(SyncPolicy::Skip).await;

    let document = store.load().unwrap();
    assert_ne!(
        document.step("hero-name").unwrap().agent_id(),
        document.step("pet-name").unwrap().agent_id()
    );
    assert_eq!(platform.ids().len(), 2);
}

#[tokio::test]
async fn test_dedupe_sweep_keeps_agents_of_same_named_steps() {
    let (platform, store, _dir) = sync_same_named_steps(SyncPolicy::Replace).await;

    let reports = run_dedupe_sweep(&registry(&platform), &store, &ScriptedConfirm::always(true))
        .await
        .unwrap();

    assert!(reports.iter().all(|(_, r)| r.deleted.is_empty()));
    assert_eq!(platform.count_named("Name"), 2);
}

// ============================================================================
// bindings against the remote side
// ============================================================================

#[tokio::test]
async fn test_dedupe_sweep_keeps_bound_older_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let store = write_flow(
        dir.path(),
        "quiz.json",
        &flow_of(vec![bound_step("genre", "Genre", "old")]),
    );
    let platform = Arc::new(
        InMemoryPlatform::new()
            .with_agent("old", "Genre", 100)
            .with_agent("new", "Genre", 200),
    );
    let confirm = ScriptedConfirm::always(true);

    let reports = run_dedupe_sweep(&registry(&platform), &store, &confirm).await.unwrap();
    assert_eq!(reports[0].1.kept, vec!["old"]);
    assert_eq!(reports[0].1.deleted, vec!["new"]);
    assert_eq!(platform.ids(), vec!["old"]);

    let report = run_sync_stage(&registry(&platform), &store, no_delay(SyncPolicy::Replace), &confirm)
        .await
        .unwrap();
    assert_eq!(report.skipped[0].1, "already provisioned as old");

    let (_, workflow) = run_assemble_stage(&store, None).unwrap();
    assert_eq!(workflow.sections[0].steps[0].agent_id, "old");
}

#[tokio::test]
async fn test_sync_stage_reprovisions_binding_to_missing_agent() {
    let dir = tempfile::tempdir().unwrap();
    let store = write_flow(
        dir.path(),
        "quiz.json",
        &flow_of(vec![
            bound_step("genre", "Genre", "gone"),
            bound_step("length", "Length", "kept"),
        ]),
    );
    let platform = Arc::new(InMemoryPlatform::new().with_agent("kept", "Length", 100));

    let report = run_sync_stage(
        &registry(&platform),
        &store,
        no_delay(SyncPolicy::Replace),
        &ScriptedConfirm::always(true),
    )
    .await
    .unwrap();

    assert_eq!(report.done, vec!["genre"]);
    assert_eq!(report.skipped, vec![("length".to_string(), "already provisioned as kept".to_string())]);

    let document = store.load().unwrap();
    let genre = document.step("genre").unwrap().agent_id().unwrap();
    assert_ne!(genre, "gone");
    assert!(platform.ids().iter().any(|id| id == genre));
}

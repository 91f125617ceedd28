//! Idempotent agent CRUD on top of any [`AgentPlatform`].
//!
//! The registry adds what the raw platform lacks: full listings across pages,
//! lookup by logical name, retry-safe deletion, duplicate sweeps, and the
//! per-step provision/clear operations that keep a step's
//! `elevenlabs_config` in line with the remote side.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use quest_flow_sdk::{log_remote_change, log_warning, RemoteChange};

use crate::config::SyncPolicy;
use crate::confirm::{Confirm, ConfirmRequest};
use crate::error::{PipelineError, RemoteSyncError, Result};
use crate::flow::{AgentConfig, StepNode};
use crate::platform::{AgentPage, AgentPlatform, ListQuery, RemoteAgent};

/// Result of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The platform had no such agent; counts as success
    AlreadyGone,
}

/// Result of a duplicate sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupeReport {
    /// Agents left in place: the ones bound to a step, or else the newest
    pub kept: Vec<String>,
    pub deleted: Vec<String>,
    /// Duplicates left alone because the operator declined
    pub declined: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Provisioned {
        agent_id: String,
        change: RemoteChange,
        /// Existing agents deleted along the way
        removed: Vec<String>,
    },
    /// The step's binding points at an agent that still exists
    AlreadyProvisioned { agent_id: String },
    Declined,
}

impl ProvisionOutcome {
    pub fn created(&self) -> bool {
        matches!(
            self,
            ProvisionOutcome::Provisioned {
                change: RemoteChange::Created,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearOutcome {
    Cleared {
        agent_id: String,
        /// Set when the remote agent was torn down too
        remote: Option<DeleteOutcome>,
    },
    NothingToClear,
    Declined,
}

pub struct AgentRegistry {
    platform: Arc<dyn AgentPlatform>,
    page_size: u32,
}

impl AgentRegistry {
    pub fn new(platform: Arc<dyn AgentPlatform>, page_size: u32) -> Self {
        Self {
            platform,
            page_size: page_size.max(1),
        }
    }

    // ========================================================================
    // Plain CRUD
    // ========================================================================

    pub async fn create(&self, config: &AgentConfig) -> Result<RemoteAgent> {
        let agent = self.platform.create(config).await?;
        log_remote_change!(&agent.agent_id, &config.name, RemoteChange::Created);
        Ok(agent)
    }

    pub async fn get(&self, agent_id: &str) -> Result<RemoteAgent> {
        Ok(self.platform.get(agent_id).await?)
    }

    pub async fn list_page(&self, query: &ListQuery) -> Result<AgentPage> {
        Ok(self.platform.list(query).await?)
    }

    /// Every agent matching `search`, following cursors to the last page.
    pub async fn list_all(&self, search: Option<&str>) -> Result<Vec<RemoteAgent>> {
        let mut agents = Vec::new();
        let mut seen_cursors: HashSet<String> = HashSet::new();
        let mut query = ListQuery {
            page_size: self.page_size,
            search: search.map(str::to_string),
            cursor: None,
        };

        loop {
            let page = self.platform.list(&query).await?;
            agents.extend(page.agents);

            if !page.has_more {
                break;
            }
            match page.next_cursor {
                Some(cursor) if seen_cursors.insert(cursor.clone()) => query.cursor = Some(cursor),
                Some(cursor) => {
                    return Err(RemoteSyncError::Decode {
                        operation: "list agents".to_string(),
                        message: format!("cursor '{}' repeated", cursor),
                    }
                    .into())
                }
                None => {
                    return Err(RemoteSyncError::Decode {
                        operation: "list agents".to_string(),
                        message: "has_more set without next_cursor".to_string(),
                    }
                    .into())
                }
            }
        }

        Ok(agents)
    }

    pub async fn update(&self, agent_id: &str, patch: &Value) -> Result<RemoteAgent> {
        let agent = self.platform.update(agent_id, patch).await?;
        log_remote_change!(agent_id, &agent.name, RemoteChange::Updated);
        Ok(agent)
    }

    /// Agents whose name equals `name` exactly, newest first.
    pub async fn find_by_name(&self, name: &str) -> Result<Vec<RemoteAgent>> {
        let mut matches: Vec<RemoteAgent> = self
            .list_all(Some(name))
            .await?
            .into_iter()
            .filter(|agent| agent.name == name)
            .collect();

        // stable: equal timestamps keep listing order
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }

    /// Delete an agent. Not-found is success so the call can be retried.
    pub async fn delete(&self, agent_id: &str) -> Result<DeleteOutcome> {
        match self.platform.delete(agent_id).await {
            Ok(()) => {
                log_remote_change!(agent_id, agent_id, RemoteChange::Deleted);
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if e.is_not_found() => {
                log_remote_change!(agent_id, agent_id, RemoteChange::AlreadyGone);
                Ok(DeleteOutcome::AlreadyGone)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Sweeps
    // ========================================================================

    /// Keep the newest agent named `name`, delete the rest.
    pub async fn dedupe(&self, name: &str, confirm: &dyn Confirm) -> Result<DedupeReport> {
        self.dedupe_in_flow(name, &HashSet::new(), confirm).await
    }

    /// Like [`dedupe`](Self::dedupe), but agents in `bound` are never deleted.
    /// When any agent with the name is bound, those are kept instead of the
    /// newest one.
    pub async fn dedupe_in_flow(
        &self,
        name: &str,
        bound: &HashSet<String>,
        confirm: &dyn Confirm,
    ) -> Result<DedupeReport> {
        let matches = self.find_by_name(name).await?;

        let (mut kept, mut duplicates): (Vec<String>, Vec<String>) = matches
            .iter()
            .map(|a| a.agent_id.clone())
            .partition(|id| bound.contains(id));
        if kept.is_empty() && !duplicates.is_empty() {
            kept.push(duplicates.remove(0));
        }

        let mut report = DedupeReport {
            kept,
            ..DedupeReport::default()
        };
        if duplicates.is_empty() {
            return Ok(report);
        }

        let request = ConfirmRequest::destructive(format!(
            "Delete {} duplicate agent(s) named '{}' (keeping {})?",
            duplicates.len(),
            name,
            report.kept.join(", ")
        ));
        if !confirm.confirm(&request) {
            report.declined = duplicates;
            return Ok(report);
        }

        for agent_id in duplicates {
            self.delete(&agent_id).await?;
            report.deleted.push(agent_id);
        }
        Ok(report)
    }

    // ========================================================================
    // Per-step operations
    // ========================================================================

    /// Make sure `step` has a live remote agent and record it in the step.
    pub async fn provision(
        &self,
        step: &mut StepNode,
        policy: SyncPolicy,
        confirm: &dyn Confirm,
    ) -> Result<ProvisionOutcome> {
        self.provision_in_flow(step, &HashSet::new(), policy, confirm)
            .await
    }

    /// Provision `step` while other steps of its document are bound to the
    /// agents in `bound_elsewhere`. Those agents may share the step's name but
    /// are never adopted, updated or deleted on its behalf.
    pub async fn provision_in_flow(
        &self,
        step: &mut StepNode,
        bound_elsewhere: &HashSet<String>,
        policy: SyncPolicy,
        confirm: &dyn Confirm,
    ) -> Result<ProvisionOutcome> {
        let config = stored_agent_config(step)?;

        if let Some(agent_id) = step.agent_id().map(str::to_string) {
            if self.is_live(&agent_id).await? {
                return Ok(ProvisionOutcome::AlreadyProvisioned { agent_id });
            }
            log_warning!(
                "step '{}' points at missing agent {}; provisioning again",
                step.id,
                agent_id
            );
        }

        let (shared, existing): (Vec<RemoteAgent>, Vec<RemoteAgent>) = self
            .find_by_name(&config.name)
            .await?
            .into_iter()
            .partition(|agent| bound_elsewhere.contains(&agent.agent_id));
        if !shared.is_empty() {
            log_warning!(
                "'{}': {} agent(s) with this name belong to other steps; leaving them alone",
                config.name,
                shared.len()
            );
        }
        let mut removed = Vec::new();

        let (agent, change) = match (policy, existing.split_first()) {
            (_, None) => (self.create_verified(&config).await?, RemoteChange::Created),

            (SyncPolicy::Replace, Some(_)) => {
                let request = ConfirmRequest::destructive(format!(
                    "Delete {} existing agent(s) named '{}' and create a new one?",
                    existing.len(),
                    config.name
                ));
                if !confirm.confirm(&request) {
                    return Ok(ProvisionOutcome::Declined);
                }
                for agent in &existing {
                    self.delete(&agent.agent_id).await?;
                    removed.push(agent.agent_id.clone());
                }
                (self.create_verified(&config).await?, RemoteChange::Created)
            }

            (SyncPolicy::Update, Some((newest, others))) => {
                let patch = Value::Object(config.to_map()?);
                let updated = self.update(&newest.agent_id, &patch).await?;
                removed = self.remove_duplicates(&config.name, others, confirm).await?;
                (
                    RemoteAgent {
                        created_at: updated.created_at.or(newest.created_at),
                        ..updated
                    },
                    RemoteChange::Updated,
                )
            }

            (SyncPolicy::Skip, Some((newest, _))) => {
                log_remote_change!(&newest.agent_id, &config.name, RemoteChange::Adopted);
                (newest.clone(), RemoteChange::Adopted)
            }
        };

        step.bind_agent(&agent.agent_id, agent.created_at.unwrap_or_else(Utc::now));
        Ok(ProvisionOutcome::Provisioned {
            agent_id: agent.agent_id,
            change,
            removed,
        })
    }

    /// Strip the step's binding; with `teardown`, delete the remote agent first.
    pub async fn clear(
        &self,
        step: &mut StepNode,
        teardown: bool,
        confirm: &dyn Confirm,
    ) -> Result<ClearOutcome> {
        let Some(agent_id) = step.agent_id().map(str::to_string) else {
            return Ok(ClearOutcome::NothingToClear);
        };

        let message = if teardown {
            format!(
                "Delete remote agent {} and clear it from step '{}'?",
                agent_id, step.id
            )
        } else {
            format!("Clear agent {} from step '{}'?", agent_id, step.id)
        };
        if !confirm.confirm(&ConfirmRequest::destructive(message)) {
            return Ok(ClearOutcome::Declined);
        }

        let remote = if teardown {
            Some(self.delete(&agent_id).await?)
        } else {
            None
        };

        step.strip_binding();
        Ok(ClearOutcome::Cleared { agent_id, remote })
    }

    /// Whether the agent `agent_id` still exists on the platform.
    pub async fn is_live(&self, agent_id: &str) -> Result<bool> {
        match self.platform.get(agent_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Send the step's current local config to its remote agent.
    pub async fn push_update(&self, step: &StepNode) -> Result<RemoteAgent> {
        let agent_id = step.agent_id().ok_or_else(|| PipelineError::Validation {
            node: Some(step.id.clone()),
            message: "step has no remote agent to update".to_string(),
        })?;
        let config = stored_agent_config(step)?;
        let patch = Value::Object(config.to_map()?);
        self.update(agent_id, &patch).await
    }

    async fn create_verified(&self, config: &AgentConfig) -> Result<RemoteAgent> {
        let created = self.create(config).await?;
        let verified = self.platform.get(&created.agent_id).await.map_err(|e| {
            if e.is_not_found() {
                RemoteSyncError::Decode {
                    operation: "verify created agent".to_string(),
                    message: format!("agent {} not found right after create", created.agent_id),
                }
            } else {
                e
            }
        })?;
        Ok(verified)
    }

    async fn remove_duplicates(
        &self,
        name: &str,
        others: &[RemoteAgent],
        confirm: &dyn Confirm,
    ) -> Result<Vec<String>> {
        if others.is_empty() {
            return Ok(Vec::new());
        }
        let request = ConfirmRequest::destructive(format!(
            "Delete {} older duplicate agent(s) named '{}'?",
            others.len(),
            name
        ));
        if !confirm.confirm(&request) {
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for agent in others {
            self.delete(&agent.agent_id).await?;
            removed.push(agent.agent_id.clone());
        }
        Ok(removed)
    }
}

/// Parse and check the agent config stored on a step.
fn stored_agent_config(step: &StepNode) -> Result<AgentConfig> {
    let stored = step
        .elevenlabs_config
        .as_ref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| PipelineError::Validation {
            node: Some(step.id.clone()),
            message: "step has no elevenlabs_config".to_string(),
        })?;

    let config = AgentConfig::from_stored(stored).map_err(|e| e.for_node(&step.id))?;
    config.check_structure().map_err(|e| e.for_node(&step.id))?;
    Ok(config)
}

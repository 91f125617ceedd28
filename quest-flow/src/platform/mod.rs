//! Remote conversational-agent platform.

pub mod elevenlabs;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteSyncError;
use crate::flow::AgentConfig;

pub use elevenlabs::ElevenLabsPlatform;

/// An agent as the platform reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAgent {
    pub agent_id: String,
    #[serde(default)]
    pub name: String,
    /// Unknown until fetched; the create endpoint only returns the ID
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl RemoteAgent {
    /// Read the fields shared by create, get, list and update responses.
    pub fn from_response(value: &Value, operation: &str) -> Result<Self, RemoteSyncError> {
        let agent_id = value
            .get("agent_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RemoteSyncError::Decode {
                operation: operation.to_string(),
                message: "missing agent_id".to_string(),
            })?;

        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let created_secs = value
            .get("created_at_unix_secs")
            .or_else(|| value.pointer("/metadata/created_at_unix_secs"))
            .and_then(Value::as_i64);
        let created_at = created_secs.and_then(|secs| Utc.timestamp_opt(secs, 0).single());

        Ok(Self {
            agent_id: agent_id.to_string(),
            name,
            created_at,
        })
    }
}

/// One `list` request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub page_size: u32,
    pub search: Option<String>,
    pub cursor: Option<String>,
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentPage {
    pub agents: Vec<RemoteAgent>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// CRUD surface of the agent platform.
///
/// `delete` reports a missing agent as [`RemoteSyncError::NotFound`]; the
/// registry decides what that means.
#[async_trait]
pub trait AgentPlatform: Send + Sync {
    async fn create(&self, config: &AgentConfig) -> Result<RemoteAgent, RemoteSyncError>;

    async fn get(&self, agent_id: &str) -> Result<RemoteAgent, RemoteSyncError>;

    async fn list(&self, query: &ListQuery) -> Result<AgentPage, RemoteSyncError>;

    /// Patch semantics: only the supplied fields change.
    async fn update(&self, agent_id: &str, patch: &Value) -> Result<RemoteAgent, RemoteSyncError>;

    async fn delete(&self, agent_id: &str) -> Result<(), RemoteSyncError>;
}

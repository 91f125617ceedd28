//! ElevenLabs Conversational AI client.
//!
//! Endpoints, relative to the configured base URL
//! (`https://api.elevenlabs.io/v1/convai` by default):
//!
//! - `POST agents/create`
//! - `GET agents/{id}`
//! - `GET agents?page_size&search&cursor`
//! - `PATCH agents/{id}`
//! - `DELETE agents/{id}`
//!
//! Every request carries the `xi-api-key` header.

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;

use super::{AgentPage, AgentPlatform, ListQuery, RemoteAgent};
use crate::config::PlatformConnection;
use crate::error::RemoteSyncError;
use crate::flow::AgentConfig;

pub struct ElevenLabsPlatform {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ElevenLabsPlatform {
    pub fn new(settings: &PlatformConnection, api_key: &str) -> Result<Self, RemoteSyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|source| RemoteSyncError::Transport {
                operation: "build client".to_string(),
                source,
            })?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Send a request and decode the body. A 404 becomes `NotFound` for
    /// `agent_id` when one is given.
    async fn execute(
        &self,
        operation: &str,
        agent_id: Option<&str>,
        request: RequestBuilder,
    ) -> Result<Value, RemoteSyncError> {
        let response = request
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .map_err(|source| RemoteSyncError::Transport {
                operation: operation.to_string(),
                source,
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| RemoteSyncError::Transport {
                operation: operation.to_string(),
                source,
            })?;

        if status == StatusCode::NOT_FOUND {
            if let Some(agent_id) = agent_id {
                return Err(RemoteSyncError::NotFound {
                    agent_id: agent_id.to_string(),
                });
            }
        }

        if !status.is_success() {
            return Err(RemoteSyncError::Status {
                operation: operation.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(|e| RemoteSyncError::Decode {
            operation: operation.to_string(),
            message: e.to_string(),
        })
    }
}

/// Decode a list response body.
pub(crate) fn parse_agent_page(value: &Value) -> Result<AgentPage, RemoteSyncError> {
    let operation = "list agents";
    let entries = value
        .get("agents")
        .and_then(Value::as_array)
        .ok_or_else(|| RemoteSyncError::Decode {
            operation: operation.to_string(),
            message: "missing agents array".to_string(),
        })?;

    let agents = entries
        .iter()
        .map(|entry| RemoteAgent::from_response(entry, operation))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AgentPage {
        agents,
        has_more: value.get("has_more").and_then(Value::as_bool).unwrap_or(false),
        next_cursor: value
            .get("next_cursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string),
    })
}

#[async_trait]
impl AgentPlatform for ElevenLabsPlatform {
    async fn create(&self, config: &AgentConfig) -> Result<RemoteAgent, RemoteSyncError> {
        let operation = "create agent";
        let request = self.client.post(self.url("agents/create")).json(config);
        let value = self.execute(operation, None, request).await?;

        let mut agent = RemoteAgent::from_response(&value, operation)?;
        if agent.name.is_empty() {
            agent.name = config.name.clone();
        }
        Ok(agent)
    }

    async fn get(&self, agent_id: &str) -> Result<RemoteAgent, RemoteSyncError> {
        let operation = "get agent";
        let request = self.client.get(self.url(&format!("agents/{}", agent_id)));
        let value = self.execute(operation, Some(agent_id), request).await?;
        RemoteAgent::from_response(&value, operation)
    }

    async fn list(&self, query: &ListQuery) -> Result<AgentPage, RemoteSyncError> {
        let mut params: Vec<(&str, String)> = vec![("page_size", query.page_size.to_string())];
        if let Some(search) = &query.search {
            params.push(("search", search.clone()));
        }
        if let Some(cursor) = &query.cursor {
            params.push(("cursor", cursor.clone()));
        }

        let request = self.client.get(self.url("agents")).query(&params);
        let value = self.execute("list agents", None, request).await?;
        parse_agent_page(&value)
    }

    async fn update(&self, agent_id: &str, patch: &Value) -> Result<RemoteAgent, RemoteSyncError> {
        let operation = "update agent";
        let request = self
            .client
            .patch(self.url(&format!("agents/{}", agent_id)))
            .json(patch);
        let value = self.execute(operation, Some(agent_id), request).await?;

        // Some deployments answer PATCH with an empty body
        if value.is_null() {
            return self.get(agent_id).await;
        }
        RemoteAgent::from_response(&value, operation)
    }

    async fn delete(&self, agent_id: &str) -> Result<(), RemoteSyncError> {
        let request = self
            .client
            .delete(self.url(&format!("agents/{}", agent_id)));
        self.execute("delete agent", Some(agent_id), request).await?;
        Ok(())
    }
}

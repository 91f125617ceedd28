//! Error taxonomy for the pipeline library.
//!
//! Binaries wrap these in `anyhow` with context; library code returns them
//! directly so callers can branch on the kind (for example treating
//! [`RemoteSyncError::NotFound`] on delete as success).

use thiserror::Error;

/// Errors raised by the agent platform client.
#[derive(Error, Debug)]
pub enum RemoteSyncError {
    /// 404 from the platform.
    #[error("remote agent not found: {agent_id}")]
    NotFound { agent_id: String },

    /// Any other non-2xx response.
    #[error("agent platform returned {status} for {operation}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    /// The request never produced a response.
    #[error("agent platform request failed for {operation}: {source}")]
    Transport {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    /// A 2xx response whose body did not match the expected shape.
    #[error("unexpected agent platform response for {operation}: {message}")]
    Decode { operation: String, message: String },
}

impl RemoteSyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteSyncError::NotFound { .. })
    }
}

/// Errors raised by the flow document store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("flow document not found: {0}")]
    Missing(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a valid flow document: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The document changed on disk after it was loaded.
    #[error("{path} was modified by another process since it was loaded; reload and retry")]
    Modified { path: String },
}

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Completion service output could not be used.
    #[error("generation failed{}: {message}", node_suffix(.node))]
    Generation {
        node: Option<String>,
        message: String,
    },

    /// A node or config does not have the expected shape.
    #[error("validation failed{}: {message}", node_suffix(.node))]
    Validation {
        node: Option<String>,
        message: String,
    },

    /// Steps that depend on each other in a loop.
    #[error("dependency cycle between steps: {}", .ids.join(", "))]
    DependencyCycle { ids: Vec<String> },

    /// Steps without a provisioned remote agent.
    #[error("steps without a remote agent: {}", .steps.join(", "))]
    MissingAgent { steps: Vec<String> },

    /// The completion service could not be reached or rejected the request.
    #[error("completion service request failed: {message}")]
    Completion { message: String },

    #[error(transparent)]
    RemoteSync(#[from] RemoteSyncError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

fn node_suffix(node: &Option<String>) -> String {
    match node {
        Some(id) => format!(" for node '{}'", id),
        None => String::new(),
    }
}

impl PipelineError {
    pub fn generation(message: impl Into<String>) -> Self {
        PipelineError::Generation {
            node: None,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation {
            node: None,
            message: message.into(),
        }
    }

    /// Attach a node ID to generation and validation errors.
    pub fn for_node(self, node_id: &str) -> Self {
        match self {
            PipelineError::Generation { node: None, message } => PipelineError::Generation {
                node: Some(node_id.to_string()),
                message,
            },
            PipelineError::Validation { node: None, message } => PipelineError::Validation {
                node: Some(node_id.to_string()),
                message,
            },
            other => other,
        }
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

//! quest-flow: compile authored quiz outlines into provisioned voice agents
//! and a client-consumable workflow document.
//!
//! The pipeline runs in five stages (see [`pipeline`]) that share state only
//! through the flow document on disk ([`flow::FlowStore`]). Remote services sit
//! behind traits: [`completion::CompletionClient`] for the language model and
//! [`platform::AgentPlatform`] for the agent platform.

pub mod cli;
pub mod completion;
pub mod config;
pub mod confirm;
pub mod error;
pub mod flow;
pub mod pipeline;
pub mod platform;
pub mod registry;
pub mod utils;
pub mod workflow;

pub use error::{PipelineError, RemoteSyncError, Result, StoreError};

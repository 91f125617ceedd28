//! Flow documents: node types, on-disk store, and structural validation.

pub mod store;
pub mod types;
pub mod validate;

pub use store::{write_atomic, DocumentVersion, FlowDocument, FlowStore};
pub use types::{
    AgentConfig, FlowNode, GroupNode, PromptConfig, ProvisionState, Section, StepNode, Workflow,
    WorkflowStep,
};
pub use validate::{validate_flow, StepGraph};

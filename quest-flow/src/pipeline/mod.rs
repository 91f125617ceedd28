//! The five pipeline stages and the batch helpers they share.
//!
//! 1. Flow Generator: outline text to flow nodes
//! 2. Prompt Config Synthesizer: step description to behaviour spec
//! 3. Agent Config Synthesizer: behaviour spec to platform agent definition
//! 4. Agent Registry Sync: one remote agent per step
//! 5. Workflow Assembler: provisioned flow to client workflow document
//!
//! Stages communicate only through the flow document on disk, so each one
//! can be rerun on its own.

pub mod batch;
pub mod step1_flow;
pub mod step2_prompt_config;
pub mod step3_agent_config;
pub mod step4_sync;
pub mod step5_assemble;
pub mod synthesized;

pub use batch::{BatchReport, NodeContext};
pub use step1_flow::{generate_flow, run_flow_stage};
pub use step2_prompt_config::{needs_prompt_config, run_prompt_config_stage, synthesize_prompt_config};
pub use step3_agent_config::{needs_agent_config, run_agent_config_stage, synthesize_agent_config};
pub use step4_sync::{run_clear, run_dedupe_sweep, run_push_updates, run_sync_stage, SyncOptions};
pub use step5_assemble::{assemble, run_assemble_stage};
pub use synthesized::Synthesized;

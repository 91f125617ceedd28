//! Node-by-node batch execution with logging and tallies.
//!
//! Stages walk their nodes sequentially. Each node runs through
//! [`execute_node`], which brackets the work with start/complete/failed
//! events. A failed node goes into the [`BatchReport`] and the operator decides
//! whether the rest of the batch runs.

use std::future::Future;

use quest_flow_sdk::{log_batch_summary, log_node_complete, log_node_failed, log_node_skipped, log_node_start};

use crate::confirm::{Confirm, ConfirmRequest};
use crate::error::{PipelineError, Result};

/// Context provided to each node in a batch
#[derive(Debug, Clone, Copy)]
pub struct NodeContext {
    /// Stage number (for logging)
    pub stage: usize,
    /// Node number (1-indexed for display)
    pub node_number: usize,
    /// Total number of nodes in this batch
    pub total_nodes: usize,
}

/// Per-node tallies for one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub done: Vec<String>,
    /// (node id, reason)
    pub skipped: Vec<(String, String)>,
    /// (node id, error message)
    pub failed: Vec<(String, String)>,
    /// The operator stopped the batch early
    pub aborted: bool,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.done.len() + self.skipped.len() + self.failed.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn done(&mut self, node_id: &str) {
        self.done.push(node_id.to_string());
    }

    pub fn skip(&mut self, node_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        log_node_skipped!(node_id, &reason);
        self.skipped.push((node_id.to_string(), reason));
    }

    pub fn fail(&mut self, node_id: &str, error: &PipelineError) {
        self.failed.push((node_id.to_string(), error.to_string()));
    }

    pub fn print_summary(&self) {
        log_batch_summary!(
            self.done.len(),
            self.skipped.len(),
            self.failed.len(),
            self.total()
        );
    }
}

/// Execute a single node with automatic logging
///
/// `work` returns the node's result and a one-line summary for the log.
pub async fn execute_node<Fut, R>(
    ctx: NodeContext,
    node_id: &str,
    description: &str,
    work: Fut,
) -> Result<R>
where
    Fut: Future<Output = Result<(R, String)>>,
{
    log_node_start!(
        ctx.stage,
        node_id,
        format!("[{}/{}] {}", ctx.node_number, ctx.total_nodes, description)
    );

    match work.await {
        Ok((result, summary)) => {
            log_node_complete!(node_id, summary);
            Ok(result)
        }
        Err(e) => {
            log_node_failed!(node_id, e);
            Err(e)
        }
    }
}

/// Ask whether to go on after `node_id` failed.
pub fn continue_after_failure(confirm: &dyn Confirm, node_id: &str, remaining: usize) -> bool {
    if remaining == 0 {
        return true;
    }
    confirm.confirm(&ConfirmRequest::low(format!(
        "Node '{}' failed. Continue with the remaining {} node(s)?",
        node_id, remaining
    )))
}

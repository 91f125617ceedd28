//! Logging surface shared by every quest-flow stage.
//!
//! Two channels:
//!
//! - [`PipelineEvent`]: structured events written to stderr as
//!   `__QF_EVENT__:<json>` lines when `QUEST_FLOW_EVENTS` is set, so wrappers
//!   and CI jobs can follow a run without scraping console text.
//! - Console macros (`log_info!`, `log_warning!`, ...): colored, human-readable
//!   lines on stdout for the operator supervising a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Environment variable that switches structured event output on.
pub const EVENTS_ENV: &str = "QUEST_FLOW_EVENTS";

/// Prefix of every structured event line on stderr.
pub const EVENT_PREFIX: &str = "__QF_EVENT__:";

/// Kind of change applied to a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteChange {
    Created,
    Updated,
    Adopted,
    Deleted,
    AlreadyGone,
}

impl std::fmt::Display for RemoteChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            RemoteChange::Created => "created",
            RemoteChange::Updated => "updated",
            RemoteChange::Adopted => "adopted",
            RemoteChange::Deleted => "deleted",
            RemoteChange::AlreadyGone => "already gone",
        };
        f.write_str(label)
    }
}

/// Structured events emitted while a stage runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        stage: usize,
        name: String,
        total_nodes: Option<usize>,
    },
    StageCompleted {
        stage: usize,
        name: String,
    },
    StageFailed {
        stage: usize,
        name: String,
        error: String,
    },
    NodeStarted {
        stage: usize,
        node_id: String,
        description: String,
    },
    NodeCompleted {
        node_id: String,
        result: Option<String>,
    },
    NodeFailed {
        node_id: String,
        error: String,
    },
    NodeSkipped {
        node_id: String,
        reason: String,
    },
    RemoteAgentChanged {
        agent_id: String,
        name: String,
        change: RemoteChange,
    },
    DocumentSaved {
        stage: usize,
        file_path: String,
        description: String,
    },
}

impl PipelineEvent {
    /// Write this event to stderr if structured events are enabled.
    pub fn emit(&self) {
        if std::env::var_os(EVENTS_ENV).is_none() {
            return;
        }
        if let Some(line) = self.to_line() {
            use std::io::Write;
            eprintln!("{}", line);
            let _ = std::io::stderr().flush();
        }
    }

    /// Render the event as a prefixed, timestamped JSON line.
    pub fn to_line(&self) -> Option<String> {
        let envelope = EventEnvelope {
            at: Utc::now(),
            event: self,
        };
        serde_json::to_string(&envelope)
            .ok()
            .map(|json| format!("{}{}", EVENT_PREFIX, json))
    }

    /// Parse a line produced by [`PipelineEvent::to_line`].
    pub fn parse_line(line: &str) -> Option<(DateTime<Utc>, PipelineEvent)> {
        let json = line.strip_prefix(EVENT_PREFIX)?;
        let owned: OwnedEnvelope = serde_json::from_str(json).ok()?;
        Some((owned.at, owned.event))
    }
}

#[derive(Serialize)]
struct EventEnvelope<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a PipelineEvent,
}

#[derive(Deserialize)]
struct OwnedEnvelope {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: PipelineEvent,
}

// ============================================================================
// Structured event macros
// ============================================================================

#[macro_export]
macro_rules! log_stage_start {
    ($stage:expr, $name:expr) => {
        $crate::PipelineEvent::StageStarted {
            stage: $stage,
            name: $name.to_string(),
            total_nodes: None,
        }
        .emit();
    };
    ($stage:expr, $name:expr, $total:expr) => {
        $crate::PipelineEvent::StageStarted {
            stage: $stage,
            name: $name.to_string(),
            total_nodes: Some($total),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_stage_complete {
    ($stage:expr, $name:expr) => {
        $crate::PipelineEvent::StageCompleted {
            stage: $stage,
            name: $name.to_string(),
        }
        .emit();
        println!("\x1b[32m✓ Stage {} complete\x1b[0m", $stage);
    };
}

#[macro_export]
macro_rules! log_stage_failed {
    ($stage:expr, $name:expr, $error:expr) => {
        $crate::PipelineEvent::StageFailed {
            stage: $stage,
            name: $name.to_string(),
            error: $error.to_string(),
        }
        .emit();
        println!("\x1b[31m✗ Stage {} failed: {}\x1b[0m", $stage, $error);
    };
}

#[macro_export]
macro_rules! log_node_start {
    ($stage:expr, $node_id:expr, $desc:expr) => {
        $crate::PipelineEvent::NodeStarted {
            stage: $stage,
            node_id: $node_id.to_string(),
            description: $desc.to_string(),
        }
        .emit();
        println!("\x1b[36m→ [{}] {}\x1b[0m", $node_id, $desc);
    };
}

#[macro_export]
macro_rules! log_node_complete {
    ($node_id:expr) => {
        $crate::PipelineEvent::NodeCompleted {
            node_id: $node_id.to_string(),
            result: None,
        }
        .emit();
        println!("\x1b[32m  ✓ {}\x1b[0m", $node_id);
    };
    ($node_id:expr, $result:expr) => {
        $crate::PipelineEvent::NodeCompleted {
            node_id: $node_id.to_string(),
            result: Some($result.to_string()),
        }
        .emit();
        println!("\x1b[32m  ✓ {}: {}\x1b[0m", $node_id, $result);
    };
}

#[macro_export]
macro_rules! log_node_failed {
    ($node_id:expr, $error:expr) => {
        $crate::PipelineEvent::NodeFailed {
            node_id: $node_id.to_string(),
            error: $error.to_string(),
        }
        .emit();
        println!("\x1b[31m  ✗ {}: {}\x1b[0m", $node_id, $error);
    };
}

#[macro_export]
macro_rules! log_node_skipped {
    ($node_id:expr, $reason:expr) => {
        $crate::PipelineEvent::NodeSkipped {
            node_id: $node_id.to_string(),
            reason: $reason.to_string(),
        }
        .emit();
        println!("\x1b[2m  - {} skipped: {}\x1b[0m", $node_id, $reason);
    };
}

#[macro_export]
macro_rules! log_remote_change {
    ($agent_id:expr, $name:expr, $change:expr) => {
        $crate::PipelineEvent::RemoteAgentChanged {
            agent_id: $agent_id.to_string(),
            name: $name.to_string(),
            change: $change,
        }
        .emit();
        println!("\x1b[35m  ☁ {} {} ({})\x1b[0m", $name, $change, $agent_id);
    };
}

#[macro_export]
macro_rules! log_document_saved {
    ($stage:expr, $path:expr, $desc:expr) => {
        $crate::PipelineEvent::DocumentSaved {
            stage: $stage,
            file_path: $path.to_string(),
            description: $desc.to_string(),
        }
        .emit();
    };
}

// ============================================================================
// Console Logging Macros
// ============================================================================

/// Logs the start of a stage with a header and description.
///
/// ```
/// use quest_flow_sdk::log_stage_header;
/// log_stage_header!(4, "Agent Registry Sync", "Provision one agent per step");
/// ```
///
/// Outputs:
/// ```text
/// ═══ STAGE 4: Agent Registry Sync ═══
/// Provision one agent per step
/// ```
#[macro_export]
macro_rules! log_stage_header {
    ($stage:expr, $title:expr, $description:expr) => {
        println!("\x1b[1;36m═══ STAGE {}: {} ═══\x1b[0m", $stage, $title);
        println!("\x1b[36m{}\x1b[0m", $description);
    };
}

/// Logs the end-of-batch tally.
///
/// ```text
/// Batch: ✓ 5 done, - 2 skipped, ✗ 1 failed (8 total)
/// ```
#[macro_export]
macro_rules! log_batch_summary {
    ($done:expr, $skipped:expr, $failed:expr, $total:expr) => {
        println!(
            "\x1b[1mBatch: \x1b[32m✓ {} done\x1b[0m, \x1b[2m- {} skipped\x1b[0m, \x1b[31m✗ {} failed\x1b[0m ({} total)",
            $done, $skipped, $failed, $total
        );
    };
}

/// Logs progress of an operation.
///
/// ```text
/// Progress: 3/5 steps
/// ```
#[macro_export]
macro_rules! log_progress {
    ($current:expr, $total:expr, $item_type:expr) => {
        println!(
            "\x1b[36mProgress: {}/{} {}\x1b[0m",
            $current, $total, $item_type
        );
    };
}

/// Logs the number of items found.
#[macro_export]
macro_rules! log_found {
    ($count:expr, $item_type:expr) => {
        println!("\x1b[36mFound {} {}\x1b[0m", $count, $item_type);
    };
}

/// Logs an informational message.
#[macro_export]
macro_rules! log_info {
    ($message:expr) => {
        println!("\x1b[36mℹ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[36mℹ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs a warning message.
///
/// ```text
/// ⚠ Warning: model-assisted conversion failed, using template
/// ```
#[macro_export]
macro_rules! log_warning {
    ($message:expr) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs that a file has been saved.
#[macro_export]
macro_rules! log_file_saved {
    ($path:expr) => {
        println!("\x1b[32m✓ Saved: {}\x1b[0m", $path);
    };
}

/// Logs a debug message (intended to be used conditionally).
#[macro_export]
macro_rules! log_debug {
    ($message:expr) => {
        println!("\x1b[2m[DEBUG] {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[2m[DEBUG] {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

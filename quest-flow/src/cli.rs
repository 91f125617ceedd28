//! Command-line arguments for the `quest-flow` binary.
//!
//! Each stage is its own subcommand and takes its input file positionally.
//! When the path is omitted, candidate files are listed and the operator picks
//! one by number.

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::config::{SyncPolicy, SynthesisStrategy};
use crate::utils::list_candidate_files;

/// Compile quiz outlines into provisioned voice agents and a client workflow
///
/// Stages, each runnable on its own:
///
/// - generate: outline text to flow document
/// - prompts: prompt config for every step
/// - agent-configs: platform agent config for every step
/// - sync: one remote agent per step
/// - compile: client workflow document
#[derive(Parser, Debug, Clone)]
#[command(name = "quest-flow")]
#[command(about = "Workflow compilation and agent-sync pipeline")]
#[command(version)]
pub struct Args {
    /// Config file layered over the user and project config
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Answer yes to every confirmation
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Print resolved settings and other debug output
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stage 1: generate a flow document from an outline
    Generate {
        /// Outline text file
        outline: Option<PathBuf>,

        /// Flow document to write (defaults to `<outline-stem>.json`)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Stage 2: draft prompt configs for steps that lack one
    Prompts(FlowArg),

    /// Stage 3: build agent configs from prompt configs
    AgentConfigs {
        #[command(flatten)]
        flow: FlowArg,

        /// Overrides `agents.strategy`
        #[arg(long, value_enum)]
        strategy: Option<SynthesisStrategy>,
    },

    /// Stage 4: provision one remote agent per step
    Sync {
        #[command(flatten)]
        flow: FlowArg,

        /// Overrides `agents.sync_policy`
        #[arg(long, value_enum)]
        policy: Option<SyncPolicy>,
    },

    /// Stage 5: compile the provisioned flow into a workflow document
    Compile {
        #[command(flatten)]
        flow: FlowArg,

        /// Workflow document to write (defaults to `<flow-stem>.workflow.json`)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Stages 2 to 5 in sequence on an existing flow document
    Run {
        #[command(flatten)]
        flow: FlowArg,

        #[arg(long, value_enum)]
        strategy: Option<SynthesisStrategy>,

        #[arg(long, value_enum)]
        policy: Option<SyncPolicy>,
    },

    /// Remote agent maintenance
    #[command(subcommand)]
    Agents(AgentsCommand),
}

#[derive(Subcommand, Debug, Clone)]
pub enum AgentsCommand {
    /// List remote agents
    List {
        /// Only agents whose name matches
        #[arg(long)]
        search: Option<String>,
    },

    /// Delete duplicate agents for every step name in a flow
    Dedupe(FlowArg),

    /// Remove agent bindings from a flow's steps
    Clear {
        #[command(flatten)]
        flow: FlowArg,

        /// Only this step
        #[arg(long, value_name = "STEP_ID")]
        step: Option<String>,

        /// Also delete the remote agents
        #[arg(long)]
        teardown: bool,
    },

    /// Delete one remote agent by id
    Delete { agent_id: String },

    /// Push edited local agent configs to their remote agents
    Push(FlowArg),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct FlowArg {
    /// Flow document (JSON array of nodes)
    pub flow: Option<PathBuf>,
}

/// Use `given`, or list files in `dir` with `extensions` and read a choice.
pub fn resolve_input(given: Option<PathBuf>, dir: &Path, extensions: &[&str], kind: &str) -> Result<PathBuf> {
    if let Some(path) = given {
        return Ok(path);
    }

    let candidates = list_candidate_files(dir, extensions)
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    if candidates.is_empty() {
        bail!(
            "No {} found in {}; pass the path explicitly",
            kind,
            dir.display()
        );
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    select_file(&candidates, kind, &mut stdin.lock(), &mut stdout.lock())
}

/// Print a numbered list and read a 1-based selection.
pub fn select_file<R: BufRead, W: Write>(
    candidates: &[PathBuf],
    kind: &str,
    input: &mut R,
    output: &mut W,
) -> Result<PathBuf> {
    writeln!(output, "Select a {}:", kind)?;
    for (i, path) in candidates.iter().enumerate() {
        writeln!(output, "  {}. {}", i + 1, path.display())?;
    }

    loop {
        write!(output, "Number [1-{}]: ", candidates.len())?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            bail!("No {} selected", kind);
        }
        match line.trim().parse::<usize>() {
            Ok(n) if (1..=candidates.len()).contains(&n) => return Ok(candidates[n - 1].clone()),
            _ => writeln!(output, "Enter a number between 1 and {}", candidates.len())?,
        }
    }
}

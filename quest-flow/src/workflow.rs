//! Command orchestration: resolve config and inputs, build the clients a
//! command needs, run the stage.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quest_flow_sdk::{log_debug, log_info, log_warning};

use crate::cli::{resolve_input, AgentsCommand, Args, Command, FlowArg};
use crate::completion::{CompletionClient, OpenAiCompletionClient};
use crate::config::{PipelineConfig, SyncPolicy, SynthesisStrategy};
use crate::confirm::{AutoApprove, Confirm, ConfirmRequest, ConsoleConfirm};
use crate::flow::FlowStore;
use crate::pipeline::{
    run_agent_config_stage, run_assemble_stage, run_clear, run_dedupe_sweep, run_flow_stage,
    run_prompt_config_stage, run_push_updates, run_sync_stage, BatchReport, SyncOptions,
};
use crate::platform::elevenlabs::ElevenLabsPlatform;
use crate::registry::AgentRegistry;

const OUTLINE_EXTENSIONS: &[&str] = &["md", "txt"];
const FLOW_EXTENSIONS: &[&str] = &["json"];

/// Everything a command needs besides its own arguments
pub struct Session {
    pub config: PipelineConfig,
    pub confirm: Box<dyn Confirm>,
    pub debug: bool,
}

impl Session {
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
        let confirm: Box<dyn Confirm> = if args.yes {
            Box::new(AutoApprove)
        } else {
            Box::new(ConsoleConfirm)
        };

        if args.debug {
            log_debug!("completion: {} ({})", config.completion.base_url, config.completion.model);
            log_debug!("platform: {}", config.platform.base_url);
            log_debug!(
                "agents: strategy {:?}, sync policy {:?}",
                config.agents.strategy,
                config.agents.sync_policy
            );
        }

        Ok(Self {
            config,
            confirm,
            debug: args.debug,
        })
    }

    fn search_dir(&self) -> PathBuf {
        self.config
            .flows_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn flow_store(&self, flow: FlowArg) -> Result<FlowStore> {
        let path = resolve_input(flow.flow, &self.search_dir(), FLOW_EXTENSIONS, "flow document")?;
        if !path.is_file() {
            bail!("Flow document not found: {}", path.display());
        }
        if self.debug {
            log_debug!("flow document: {}", path.display());
        }
        Ok(FlowStore::new(path))
    }

    fn completion_client(&self) -> Result<OpenAiCompletionClient> {
        let key = self
            .config
            .completion_api_key()
            .context("The completion service needs credentials")?;
        Ok(OpenAiCompletionClient::new(&self.config.completion, key)?)
    }

    fn registry(&self) -> Result<AgentRegistry> {
        let key = self
            .config
            .platform_api_key()
            .context("The agent platform needs credentials")?;
        let platform = ElevenLabsPlatform::new(&self.config.platform, key)?;
        Ok(AgentRegistry::new(Arc::new(platform), self.config.platform.page_size))
    }
}

/// Run the command described by `args`.
pub async fn run(args: Args) -> Result<()> {
    let session = Session::from_args(&args)?;
    let confirm = session.confirm.as_ref();

    match args.command {
        Command::Generate { outline, output } => {
            let outline = resolve_input(outline, &session.search_dir(), OUTLINE_EXTENSIONS, "outline")?;
            let output = output.unwrap_or_else(|| outline.with_extension("json"));
            let client = session.completion_client()?;
            let store = FlowStore::new(&output);

            run_flow_stage(&client, &outline, &store, confirm)
                .await
                .with_context(|| format!("Failed to generate a flow from {}", outline.display()))?;
        }

        Command::Prompts(flow) => {
            let store = session.flow_store(flow)?;
            prompts(&session, &store).await?;
        }

        Command::AgentConfigs { flow, strategy } => {
            let store = session.flow_store(flow)?;
            let strategy = strategy.unwrap_or(session.config.agents.strategy);
            agent_configs(&session, &store, strategy).await?;
        }

        Command::Sync { flow, policy } => {
            let store = session.flow_store(flow)?;
            let policy = policy.unwrap_or(session.config.agents.sync_policy);
            sync(&session, &store, policy).await?;
        }

        Command::Compile { flow, output } => {
            let store = session.flow_store(flow)?;
            compile(&store, output.as_deref())?;
        }

        Command::Run {
            flow,
            strategy,
            policy,
        } => {
            let store = session.flow_store(flow)?;
            let strategy = strategy.unwrap_or(session.config.agents.strategy);
            let policy = policy.unwrap_or(session.config.agents.sync_policy);

            if prompts(&session, &store).await?.aborted
                || agent_configs(&session, &store, strategy).await?.aborted
                || sync(&session, &store, policy).await?.aborted
            {
                log_info!("Stopped by operator");
                return Ok(());
            }
            compile(&store, None)?;
        }

        Command::Agents(command) => agents(&session, command).await?,
    }

    Ok(())
}

async fn prompts(session: &Session, store: &FlowStore) -> Result<BatchReport> {
    let client = session.completion_client()?;
    let report = run_prompt_config_stage(
        &client,
        store,
        &session.config.agents.defaults,
        session.confirm.as_ref(),
    )
    .await
    .with_context(|| format!("Prompt config stage failed on {}", store.path().display()))?;
    warn_failures(&report);
    Ok(report)
}

async fn agent_configs(session: &Session, store: &FlowStore, strategy: SynthesisStrategy) -> Result<BatchReport> {
    let client = match strategy {
        SynthesisStrategy::ModelAssisted => Some(session.completion_client()?),
        SynthesisStrategy::Template => None,
    };
    let report = run_agent_config_stage(
        client.as_ref().map(|c| c as &dyn CompletionClient),
        store,
        strategy,
        &session.config.agents.defaults,
        session.confirm.as_ref(),
    )
    .await
    .with_context(|| format!("Agent config stage failed on {}", store.path().display()))?;
    warn_failures(&report);
    Ok(report)
}

async fn sync(session: &Session, store: &FlowStore, policy: SyncPolicy) -> Result<BatchReport> {
    let registry = session.registry()?;
    let options = SyncOptions::new(policy, &session.config.platform);
    let report = run_sync_stage(&registry, store, options, session.confirm.as_ref())
        .await
        .with_context(|| format!("Agent sync failed on {}", store.path().display()))?;
    warn_failures(&report);
    Ok(report)
}

fn compile(store: &FlowStore, output: Option<&Path>) -> Result<()> {
    let (path, workflow) = run_assemble_stage(store, output)
        .with_context(|| format!("Failed to assemble {}", store.path().display()))?;
    log_info!(
        "{} section(s), {} step(s) written to {}",
        workflow.sections.len(),
        workflow.step_count(),
        path.display()
    );
    Ok(())
}

async fn agents(session: &Session, command: AgentsCommand) -> Result<()> {
    let registry = session.registry()?;
    let confirm = session.confirm.as_ref();

    match command {
        AgentsCommand::List { search } => {
            let agents = registry.list_all(search.as_deref()).await?;
            for agent in &agents {
                let created = agent
                    .created_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}  {}  {}", agent.agent_id, created, agent.name);
            }
            log_info!("{} agent(s)", agents.len());
        }
        AgentsCommand::Dedupe(flow) => {
            let store = session.flow_store(flow)?;
            let reports = run_dedupe_sweep(&registry, &store, confirm).await?;
            let deleted: usize = reports.iter().map(|(_, r)| r.deleted.len()).sum();
            log_info!("{} duplicate agent(s) deleted", deleted);
        }
        AgentsCommand::Clear {
            flow,
            step,
            teardown,
        } => {
            let store = session.flow_store(flow)?;
            let report = run_clear(&registry, &store, step.as_deref(), teardown, confirm).await?;
            warn_failures(&report);
        }
        AgentsCommand::Delete { agent_id } => {
            if !confirm.confirm(&ConfirmRequest::destructive(format!(
                "Delete remote agent {}?",
                agent_id
            ))) {
                return Ok(());
            }
            registry.delete(&agent_id).await?;
        }
        AgentsCommand::Push(flow) => {
            let store = session.flow_store(flow)?;
            let report = run_push_updates(&registry, &store, confirm).await?;
            warn_failures(&report);
        }
    }
    Ok(())
}

fn warn_failures(report: &BatchReport) {
    for (id, error) in &report.failed {
        log_warning!("{}: {}", id, error);
    }
}

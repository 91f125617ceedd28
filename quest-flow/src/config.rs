//! Pipeline configuration.
//!
//! Layers, lowest precedence first: built-in defaults, the user config file
//! (`config.yaml` in the platform config directory), `./quest-flow.yaml`, an
//! explicit `--config` file, then environment variables. CLI flags are applied
//! last by the caller.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::utils::{local_config_path, user_config_path};

pub const DEFAULT_COMPLETION_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_COMPLETION_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_PLATFORM_BASE_URL: &str = "https://api.elevenlabs.io/v1/convai";

pub const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";
pub const DEFAULT_AGENT_LLM: &str = "gpt-4o-mini";
pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_TTS_MODEL: &str = "eleven_flash_v2";
pub const DEFAULT_AUDIO_FORMAT: &str = "pcm_16000";
pub const DEFAULT_TURN_TIMEOUT_SECS: u32 = 7;
pub const DEFAULT_MAX_DURATION_SECS: u32 = 300;

/// How agent configs are produced from prompt configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisStrategy {
    /// Ask the completion service, fall back to the template on failure.
    ModelAssisted,
    /// Derive the config deterministically.
    Template,
}

/// What to do when a remote agent with the step's name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Delete the existing agents, then create a fresh one.
    Replace,
    /// Patch the newest existing agent and remove other duplicates.
    Update,
    /// Adopt the newest existing agent as-is.
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_COMPLETION_BASE_URL.to_string(),
            model: DEFAULT_COMPLETION_MODEL.to_string(),
            temperature: 0.2,
            timeout_secs: 120,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConnection {
    pub base_url: String,
    /// Pause between consecutive create calls.
    pub create_delay_ms: u64,
    pub page_size: u32,
    pub timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for PlatformConnection {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PLATFORM_BASE_URL.to_string(),
            create_delay_ms: 1000,
            page_size: 100,
            timeout_secs: 60,
            api_key: None,
        }
    }
}

/// Fixed values used wherever a prompt config does not say otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    pub voice_id: String,
    pub llm: String,
    pub temperature: f32,
    pub language: String,
    pub tts_model_id: String,
    pub audio_format: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub optimize_streaming_latency: u8,
    pub turn_timeout_secs: u32,
    pub max_duration_secs: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            voice_id: DEFAULT_VOICE_ID.to_string(),
            llm: DEFAULT_AGENT_LLM.to_string(),
            temperature: 0.5,
            language: DEFAULT_LANGUAGE.to_string(),
            tts_model_id: DEFAULT_TTS_MODEL.to_string(),
            audio_format: DEFAULT_AUDIO_FORMAT.to_string(),
            stability: 0.5,
            similarity_boost: 0.8,
            optimize_streaming_latency: 3,
            turn_timeout_secs: DEFAULT_TURN_TIMEOUT_SECS,
            max_duration_secs: DEFAULT_MAX_DURATION_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub strategy: SynthesisStrategy,
    pub sync_policy: SyncPolicy,
    pub defaults: AgentDefaults,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            strategy: SynthesisStrategy::ModelAssisted,
            sync_policy: SyncPolicy::Replace,
            defaults: AgentDefaults::default(),
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub completion: CompletionSettings,
    pub platform: PlatformConnection,
    pub agents: AgentSettings,
    /// Directory searched for flow documents when no path is given.
    pub flows_dir: Option<PathBuf>,
}

impl PipelineConfig {
    /// Load every config layer and the process environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut files: Vec<PathBuf> = Vec::new();
        if let Some(path) = user_config_path() {
            files.push(path);
        }
        files.push(local_config_path());

        let mut config = Self::from_files(&files, explicit)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Merge YAML files over the defaults. Missing optional files are skipped;
    /// a missing explicit file is an error.
    pub fn from_files(optional: &[PathBuf], explicit: Option<&Path>) -> Result<Self> {
        let mut merged = serde_yaml::to_value(Self::default())
            .map_err(|e| PipelineError::Config(e.to_string()))?;

        for path in optional.iter().filter(|p| p.is_file()) {
            merge_yaml(&mut merged, read_yaml(path)?);
        }

        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(PipelineError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            merge_yaml(&mut merged, read_yaml(path)?);
        }

        serde_yaml::from_value(merged).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENAI_API_KEY").filter(|v| !v.is_empty()) {
            self.completion.api_key = Some(key);
        }
        if let Some(key) = lookup("ELEVENLABS_API_KEY").filter(|v| !v.is_empty()) {
            self.platform.api_key = Some(key);
        }
        if let Some(model) = lookup("QUEST_FLOW_COMPLETION_MODEL") {
            self.completion.model = model;
        }
        if let Some(url) = lookup("QUEST_FLOW_COMPLETION_BASE_URL") {
            self.completion.base_url = url;
        }
        if let Some(url) = lookup("QUEST_FLOW_PLATFORM_BASE_URL") {
            self.platform.base_url = url;
        }
    }

    pub fn completion_api_key(&self) -> Result<&str> {
        self.completion
            .api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Config("OPENAI_API_KEY is not set".to_string()))
    }

    pub fn platform_api_key(&self) -> Result<&str> {
        self.platform
            .api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Config("ELEVENLABS_API_KEY is not set".to_string()))
    }
}

fn read_yaml(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_yaml::from_str(&content)
        .map_err(|e| PipelineError::Config(format!("invalid YAML in {}: {}", path.display(), e)))
}

/// Recursively overlay `overlay` onto `base`; mappings merge, everything else replaces.
fn merge_yaml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

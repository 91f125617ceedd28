//! Data types for flow documents and the assembled workflow.
//!
//! A flow document is a JSON array of nodes:
//!
//! 1. **Group nodes** - organizational, become workflow sections
//! 2. **Step nodes** - one conversation topic each, bound to one remote agent
//!
//! On disk the two kinds are told apart by the `group-` ID prefix. That check
//! lives in the [`FlowNode`] deserializer only; everything else matches on the
//! enum.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

use crate::config::AgentDefaults;
use crate::error::{PipelineError, Result};
use crate::utils::slugify;

/// ID prefix that marks a group node on disk.
pub const GROUP_PREFIX: &str = "group-";

/// Keys written into `elevenlabs_config` once a remote agent exists.
pub const AGENT_ID_KEY: &str = "agent_id";
pub const CREATED_AT_KEY: &str = "created_at";

// ============================================================================
// Flow nodes
// ============================================================================

/// A single node in a flow document
#[derive(Debug, Clone, PartialEq)]
pub enum FlowNode {
    Group(GroupNode),
    Step(StepNode),
}

impl FlowNode {
    pub fn id(&self) -> &str {
        match self {
            FlowNode::Group(group) => &group.id,
            FlowNode::Step(step) => &step.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FlowNode::Group(group) => &group.name,
            FlowNode::Step(step) => &step.name,
        }
    }

    /// Dependency references. Groups carry none.
    pub fn depends_on(&self) -> &[String] {
        match self {
            FlowNode::Group(_) => &[],
            FlowNode::Step(step) => &step.depends_on,
        }
    }

    pub fn as_step(&self) -> Option<&StepNode> {
        match self {
            FlowNode::Step(step) => Some(step),
            FlowNode::Group(_) => None,
        }
    }

    pub fn as_step_mut(&mut self) -> Option<&mut StepNode> {
        match self {
            FlowNode::Step(step) => Some(step),
            FlowNode::Group(_) => None,
        }
    }
}

impl Serialize for FlowNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FlowNode::Group(group) => group.serialize(serializer),
            FlowNode::Step(step) => step.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FlowNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| D::Error::custom("flow node is missing a string `id`"))?;

        if is_group_id(id) {
            serde_json::from_value(value)
                .map(FlowNode::Group)
                .map_err(D::Error::custom)
        } else {
            serde_json::from_value(value)
                .map(FlowNode::Step)
                .map_err(D::Error::custom)
        }
    }
}

/// Whether an on-disk ID denotes a group node.
pub fn is_group_id(id: &str) -> bool {
    id.starts_with(GROUP_PREFIX)
}

/// Build a group ID from a slug, adding the prefix when missing.
pub fn group_id(slug: &str) -> String {
    if is_group_id(slug) {
        slug.to_string()
    } else {
        format!("{}{}", GROUP_PREFIX, slug)
    }
}

/// Strip the group prefix from a slug so a step ID never looks like a group.
pub fn step_id(slug: &str) -> String {
    let stripped = slug.strip_prefix(GROUP_PREFIX).unwrap_or(slug);
    if stripped.is_empty() {
        "step".to_string()
    } else {
        stripped.to_string()
    }
}

/// Organizational node; becomes a workflow section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupNode {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Fields this crate does not interpret, kept on round trip
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One conversation topic, provisioned as one remote agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Node IDs (steps or groups) that must come first
    #[serde(rename = "dependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Platform-independent behaviour spec, see [`PromptConfig`]
    #[serde(default)]
    pub prompt_config: Option<Map<String, Value>>,

    /// Platform-ready agent definition, see [`AgentConfig`]. Carries
    /// `agent_id` and `created_at` once provisioned.
    #[serde(default)]
    pub elevenlabs_config: Option<Map<String, Value>>,

    /// Remote agent that was bound before the last clear
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleared_agent_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Where a step stands with respect to the agent registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Unprovisioned,
    Provisioned,
    /// Binding stripped by an explicit clear; the remote agent may still exist
    Cleared,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProvisionState::Unprovisioned => "unprovisioned",
            ProvisionState::Provisioned => "provisioned",
            ProvisionState::Cleared => "cleared",
        };
        f.write_str(label)
    }
}

impl StepNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            depends_on: Vec::new(),
            prompt_config: None,
            elevenlabs_config: None,
            cleared_agent_id: None,
            extra: Map::new(),
        }
    }

    /// Name used for the remote agent. Falls back to the node ID.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.elevenlabs_config
            .as_ref()?
            .get(AGENT_ID_KEY)?
            .as_str()
            .filter(|id| !id.is_empty())
    }

    pub fn provision_state(&self) -> ProvisionState {
        if self.agent_id().is_some() {
            ProvisionState::Provisioned
        } else if self.cleared_agent_id.is_some() {
            ProvisionState::Cleared
        } else {
            ProvisionState::Unprovisioned
        }
    }

    pub fn has_prompt_config(&self) -> bool {
        self.prompt_config.as_ref().is_some_and(|c| !c.is_empty())
    }

    pub fn has_agent_config(&self) -> bool {
        self.elevenlabs_config.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Record a provisioned remote agent in `elevenlabs_config`.
    pub fn bind_agent(&mut self, agent_id: &str, created_at: DateTime<Utc>) {
        let config = self.elevenlabs_config.get_or_insert_with(Map::new);
        config.insert(AGENT_ID_KEY.to_string(), Value::String(agent_id.to_string()));
        config.insert(
            CREATED_AT_KEY.to_string(),
            Value::String(created_at.to_rfc3339()),
        );
        self.cleared_agent_id = None;
    }

    /// Remove `agent_id` and `created_at`, keeping every other key. Returns
    /// the agent ID that was bound.
    pub fn strip_binding(&mut self) -> Option<String> {
        let config = self.elevenlabs_config.as_mut()?;
        let removed = config
            .remove(AGENT_ID_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|id| !id.is_empty());
        config.remove(CREATED_AT_KEY);

        if let Some(id) = &removed {
            self.cleared_agent_id = Some(id.clone());
        }
        removed
    }
}

// ============================================================================
// Prompt config
// ============================================================================

/// Platform-independent behaviour specification for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default)]
    pub name: String,

    /// Persona and instructions for the agent
    #[serde(default)]
    pub role: String,

    #[serde(default)]
    pub first_message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,

    /// Answers the agent should capture
    #[serde(default)]
    pub data_fields: Vec<DataField>,

    #[serde(default)]
    pub turn: TurnSettings,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataField {
    pub identifier: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,
    #[serde(default)]
    pub description: String,
}

fn default_field_type() -> String {
    "string".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_timeout_secs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u32>,
}

impl PromptConfig {
    /// Deterministic config built from the step alone.
    pub fn minimal(step: &StepNode, defaults: &AgentDefaults) -> Self {
        let name = step.display_name().to_string();
        let topic = name.to_lowercase();
        let key = slugify(&step.id).replace('-', "_");

        let mut role = format!(
            "You are a friendly storytelling guide talking with a child. \
             Your job in this part of the quiz: {}.",
            name
        );
        if !step.description.trim().is_empty() {
            role.push(' ');
            role.push_str(step.description.trim());
        }
        role.push_str(" Ask one short question at a time and confirm the answer back.");

        Self {
            name: name.clone(),
            role,
            first_message: format!("Let's talk about {}!", topic),
            voice_id: Some(defaults.voice_id.clone()),
            language: Some(defaults.language.clone()),
            success_criteria: vec![SuccessCriterion {
                id: format!("{}_answered", key),
                name: format!("{} answered", name),
                prompt: format!("The child gave a clear answer about {}.", topic),
            }],
            data_fields: vec![DataField {
                identifier: key,
                field_type: default_field_type(),
                description: format!("The child's answer about {}", topic),
            }],
            turn: TurnSettings {
                turn_timeout_secs: Some(defaults.turn_timeout_secs),
                max_duration_secs: Some(defaults.max_duration_secs),
            },
            extra: Map::new(),
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        serde_json::from_value(Value::Object(map.clone()))
            .map_err(|e| PipelineError::validation(format!("invalid prompt_config: {}", e)))
    }

    pub fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(PipelineError::validation("prompt_config must be a JSON object")),
        }
    }
}

// ============================================================================
// Agent config
// ============================================================================

/// Keys every agent config sent to the platform must carry.
pub const REQUIRED_AGENT_KEYS: [&str; 3] = ["name", "conversation_config", "platform_settings"];

/// Platform-ready agent definition, shaped like the ElevenLabs create payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub conversation_config: ConversationConfig,

    #[serde(default)]
    pub platform_settings: PlatformSettings,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    pub agent: AgentSection,
    pub asr: AsrSection,
    pub tts: TtsSection,
    pub turn: TurnSection,
    pub conversation: ConversationSection,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub first_message: String,
    pub language: String,
    pub prompt: PromptSection,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            first_message: String::new(),
            language: crate::config::DEFAULT_LANGUAGE.to_string(),
            prompt: PromptSection::default(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSection {
    pub prompt: String,
    pub llm: String,
    pub temperature: f32,
}

impl Default for PromptSection {
    fn default() -> Self {
        let defaults = AgentDefaults::default();
        Self {
            prompt: String::new(),
            llm: defaults.llm,
            temperature: defaults.temperature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrSection {
    pub quality: String,
    pub provider: String,
    pub user_input_audio_format: String,
}

impl Default for AsrSection {
    fn default() -> Self {
        Self {
            quality: "high".to_string(),
            provider: "elevenlabs".to_string(),
            user_input_audio_format: crate::config::DEFAULT_AUDIO_FORMAT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSection {
    pub model_id: String,
    pub voice_id: String,
    pub agent_output_audio_format: String,
    pub optimize_streaming_latency: u8,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for TtsSection {
    fn default() -> Self {
        let defaults = AgentDefaults::default();
        Self {
            model_id: defaults.tts_model_id,
            voice_id: defaults.voice_id,
            agent_output_audio_format: defaults.audio_format,
            optimize_streaming_latency: defaults.optimize_streaming_latency,
            stability: defaults.stability,
            similarity_boost: defaults.similarity_boost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnSection {
    pub turn_timeout: u32,
    pub mode: String,
}

impl Default for TurnSection {
    fn default() -> Self {
        Self {
            turn_timeout: crate::config::DEFAULT_TURN_TIMEOUT_SECS,
            mode: "turn".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    pub max_duration_seconds: u32,
    pub client_events: Vec<String>,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            max_duration_seconds: crate::config::DEFAULT_MAX_DURATION_SECS,
            client_events: ["audio", "interruption", "agent_response", "user_transcript"]
                .iter()
                .map(|e| e.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub evaluation: EvaluationSettings,
    /// Keyed by field identifier, in declaration order
    pub data_collection: IndexMap<String, DataCollectionField>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    pub criteria: Vec<EvaluationCriterion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationCriterion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default = "default_criterion_type")]
    pub criterion_type: String,
    #[serde(default)]
    pub conversation_goal_prompt: String,
}

fn default_criterion_type() -> String {
    "prompt".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCollectionField {
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,
    #[serde(default)]
    pub description: String,
}

impl AgentConfig {
    /// Deterministic translation of a prompt config.
    pub fn from_prompt_config(prompt: &PromptConfig, defaults: &AgentDefaults) -> Self {
        let voice_id = prompt
            .voice_id
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(&defaults.voice_id)
            .to_string();
        let language = prompt
            .language
            .as_deref()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or(&defaults.language)
            .to_string();

        let criteria = prompt
            .success_criteria
            .iter()
            .enumerate()
            .map(|(index, criterion)| {
                let id = if criterion.id.trim().is_empty() {
                    let slug = slugify(&criterion.name).replace('-', "_");
                    if slug.is_empty() {
                        format!("criterion_{}", index + 1)
                    } else {
                        slug
                    }
                } else {
                    criterion.id.clone()
                };
                EvaluationCriterion {
                    id,
                    name: criterion.name.clone(),
                    criterion_type: default_criterion_type(),
                    conversation_goal_prompt: criterion.prompt.clone(),
                }
            })
            .collect();

        let data_collection = prompt
            .data_fields
            .iter()
            .map(|field| {
                (
                    field.identifier.clone(),
                    DataCollectionField {
                        field_type: field.field_type.clone(),
                        description: field.description.clone(),
                    },
                )
            })
            .collect();

        Self {
            name: prompt.name.clone(),
            conversation_config: ConversationConfig {
                agent: AgentSection {
                    first_message: prompt.first_message.clone(),
                    language,
                    prompt: PromptSection {
                        prompt: prompt.role.clone(),
                        llm: defaults.llm.clone(),
                        temperature: defaults.temperature,
                    },
                    extra: Map::new(),
                },
                asr: AsrSection {
                    user_input_audio_format: defaults.audio_format.clone(),
                    ..AsrSection::default()
                },
                tts: TtsSection {
                    model_id: defaults.tts_model_id.clone(),
                    voice_id,
                    agent_output_audio_format: defaults.audio_format.clone(),
                    optimize_streaming_latency: defaults.optimize_streaming_latency,
                    stability: defaults.stability,
                    similarity_boost: defaults.similarity_boost,
                },
                turn: TurnSection {
                    turn_timeout: prompt
                        .turn
                        .turn_timeout_secs
                        .unwrap_or(defaults.turn_timeout_secs),
                    ..TurnSection::default()
                },
                conversation: ConversationSection {
                    max_duration_seconds: prompt
                        .turn
                        .max_duration_secs
                        .unwrap_or(defaults.max_duration_secs),
                    ..ConversationSection::default()
                },
                extra: Map::new(),
            },
            platform_settings: PlatformSettings {
                evaluation: EvaluationSettings { criteria },
                data_collection,
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }

    /// Parse a config stored on a step, ignoring the registry binding keys.
    /// The required top-level keys must be present.
    pub fn from_stored(map: &Map<String, Value>) -> Result<Self> {
        if let Some(missing) = REQUIRED_AGENT_KEYS.iter().find(|key| !map.contains_key(**key)) {
            return Err(PipelineError::validation(format!(
                "elevenlabs_config is missing required key '{}'",
                missing
            )));
        }

        let mut payload = map.clone();
        payload.remove(AGENT_ID_KEY);
        payload.remove(CREATED_AT_KEY);

        serde_json::from_value(Value::Object(payload))
            .map_err(|e| PipelineError::validation(format!("invalid elevenlabs_config: {}", e)))
    }

    /// Fill values a generated config may have left empty.
    pub fn fill_gaps(&mut self, fallback_name: &str, prompt: Option<&PromptConfig>, defaults: &AgentDefaults) {
        if self.name.trim().is_empty() {
            self.name = fallback_name.to_string();
        }

        let agent = &mut self.conversation_config.agent;
        if agent.first_message.trim().is_empty() {
            agent.first_message = prompt
                .map(|p| p.first_message.clone())
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| format!("Hi! Let's talk about {}.", fallback_name.to_lowercase()));
        }
        if agent.prompt.prompt.trim().is_empty() {
            agent.prompt.prompt = prompt
                .map(|p| p.role.clone())
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| format!("You are a friendly guide. Topic: {}.", fallback_name));
        }
        if agent.prompt.llm.trim().is_empty() {
            agent.prompt.llm = defaults.llm.clone();
        }
        if agent.language.trim().is_empty() {
            agent.language = defaults.language.clone();
        }

        let tts = &mut self.conversation_config.tts;
        if tts.voice_id.trim().is_empty() {
            tts.voice_id = defaults.voice_id.clone();
        }
        if tts.model_id.trim().is_empty() {
            tts.model_id = defaults.tts_model_id.clone();
        }
    }

    /// Check the fields the platform rejects when empty.
    pub fn check_structure(&self) -> Result<()> {
        let checks = [
            ("name", self.name.as_str()),
            (
                "conversation_config.agent.first_message",
                self.conversation_config.agent.first_message.as_str(),
            ),
            (
                "conversation_config.agent.prompt.prompt",
                self.conversation_config.agent.prompt.prompt.as_str(),
            ),
            (
                "conversation_config.tts.voice_id",
                self.conversation_config.tts.voice_id.as_str(),
            ),
        ];

        for (path, value) in checks {
            if value.trim().is_empty() {
                return Err(PipelineError::validation(format!(
                    "agent config field '{}' is empty",
                    path
                )));
            }
        }

        for (key, field) in &self.platform_settings.data_collection {
            if key.trim().is_empty() {
                return Err(PipelineError::validation(
                    "data_collection contains an empty field identifier",
                ));
            }
            if !matches!(field.field_type.as_str(), "string" | "boolean" | "integer" | "number") {
                return Err(PipelineError::validation(format!(
                    "data_collection field '{}' has unsupported type '{}'",
                    key, field.field_type
                )));
            }
        }

        Ok(())
    }

    pub fn to_map(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(PipelineError::validation("agent config must be a JSON object")),
        }
    }
}

// ============================================================================
// Workflow document
// ============================================================================

/// Assembled workflow consumed by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub title: String,
    #[serde(rename = "agentId")]
    pub agent_id: String,
}

impl Workflow {
    pub fn step_count(&self) -> usize {
        self.sections.iter().map(|s| s.steps.len()).sum()
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Pixel coordinates inside the scene viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Front,
    Right,
    Left,
    Back,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::Front
    }
}

/// Emotion a character can visibly carry while thinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emotion {
    Love,
    Anger,
    Sadness,
    Surprise,
    Fear,
}

impl Emotion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Love => "love",
            Emotion::Anger => "anger",
            Emotion::Sadness => "sadness",
            Emotion::Surprise => "surprise",
            Emotion::Fear => "fear",
        }
    }

    /// Detect an emotion from a free-text mood phrase, matching the noun or
    /// its common adjective form.
    pub fn detect(mood: &str) -> Option<Self> {
        let lower = mood.to_lowercase();
        let pairs: [(&str, &str, Emotion); 5] = [
            ("love", "loving", Emotion::Love),
            ("anger", "angry", Emotion::Anger),
            ("sadness", "sad", Emotion::Sadness),
            ("surprise", "surprised", Emotion::Surprise),
            ("fear", "afraid", Emotion::Fear),
        ];
        pairs
            .iter()
            .find(|(noun, adjective, _)| lower.contains(noun) || lower.contains(adjective))
            .map(|(_, _, emotion)| *emotion)
    }
}

/// What a character is currently doing. `Thinking` may carry a cosmetic
/// emotion suffix derived from the previous turn's mood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterAction {
    Idle,
    Thinking(Option<Emotion>),
    Speaking,
}

impl CharacterAction {
    /// Thinking state colored by the previous turn's mood, when one of the
    /// known emotions is recognizable in it.
    pub fn thinking_about(previous_mood: Option<&str>) -> Self {
        CharacterAction::Thinking(previous_mood.and_then(Emotion::detect))
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self, CharacterAction::Speaking)
    }
}

impl Default for CharacterAction {
    fn default() -> Self {
        CharacterAction::Idle
    }
}

impl fmt::Display for CharacterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharacterAction::Idle => write!(f, "idle"),
            CharacterAction::Thinking(None) => write!(f, "thinking"),
            CharacterAction::Thinking(Some(emotion)) => write!(f, "thinking:{}", emotion.as_str()),
            CharacterAction::Speaking => write!(f, "speaking"),
        }
    }
}

impl FromStr for CharacterAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(CharacterAction::Idle),
            "thinking" => Ok(CharacterAction::Thinking(None)),
            "thinking:love" => Ok(CharacterAction::Thinking(Some(Emotion::Love))),
            "thinking:anger" => Ok(CharacterAction::Thinking(Some(Emotion::Anger))),
            "thinking:sadness" => Ok(CharacterAction::Thinking(Some(Emotion::Sadness))),
            "thinking:surprise" => Ok(CharacterAction::Thinking(Some(Emotion::Surprise))),
            "thinking:fear" => Ok(CharacterAction::Thinking(Some(Emotion::Fear))),
            "speaking" => Ok(CharacterAction::Speaking),
            other => Err(format!("unknown character action: {other}")),
        }
    }
}

impl Serialize for CharacterAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CharacterAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Language-model binding for one character. Characters with structurally
/// equal bindings share a single completion handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmBinding {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

fn default_mood() -> String {
    "neutral".to_string()
}

/// Immutable per-scene character definition. Never mutated after the scene
/// starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterConfig {
    pub id: String,
    pub name: String,
    /// Display color, hex string.
    pub color: String,
    pub role: String,
    pub visual: String,
    pub llm: LlmBinding,
    pub initial_position: Position,
    #[serde(default)]
    pub initial_direction: Direction,
    #[serde(default)]
    pub initial_action: CharacterAction,
    #[serde(default = "default_mood")]
    pub initial_mood: String,
}

/// Live per-character state. Owned by the conversation state and mutated
/// only from the orchestrator's control flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    pub id: String,
    pub name: String,
    pub color: String,
    pub role: String,
    pub visual: String,
    pub llm: LlmBinding,
    pub position: Position,
    pub direction: Direction,
    pub action: CharacterAction,
    /// Unix seconds when the current action began.
    pub action_started_at: f64,
    #[serde(default)]
    pub action_estimated_duration: Option<f64>,
    pub current_mood: String,
    #[serde(default)]
    pub end_conversation_requested: bool,
    #[serde(default)]
    pub end_conversation_requested_at: Option<f64>,
    #[serde(default)]
    pub end_conversation_requested_validity: Option<f64>,
}

impl CharacterState {
    pub fn from_config(config: &CharacterConfig, started_at: f64) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            color: config.color.clone(),
            role: config.role.clone(),
            visual: config.visual.clone(),
            llm: config.llm.clone(),
            position: config.initial_position,
            direction: config.initial_direction,
            action: config.initial_action,
            action_started_at: started_at,
            action_estimated_duration: None,
            current_mood: config.initial_mood.clone(),
            end_conversation_requested: false,
            end_conversation_requested_at: None,
            end_conversation_requested_validity: None,
        }
    }
}

/// One spoken turn. Append-only once in the message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub character: String,
    /// Recipient label as the model produced it, not necessarily a valid id.
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    pub thoughts: String,
    pub mood: String,
    pub mood_emoji: String,
    #[serde(default)]
    pub reaction_on_previous_message: Option<String>,
    #[serde(default)]
    pub conversation_rating: Option<u8>,
    #[serde(default)]
    pub end_conversation: bool,
    /// ISO-8601 wall-clock time.
    pub timestamp: String,
    pub unix_timestamp: f64,
    pub calculated_speaking_time: f64,
}

/// Full live state of the active scene, broadcast verbatim to viewers and
/// persisted verbatim in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneState {
    pub scene_id: i64,
    pub scene_config_id: i64,
    pub characters: BTreeMap<String, CharacterState>,
    pub messages: Vec<Message>,
    pub started_at: f64,
    pub conversation_active: bool,
    pub conversation_ended: bool,
    #[serde(default)]
    pub ended_at: Option<f64>,
    #[serde(default)]
    pub viewer_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneConfigStatus {
    Proposed,
    Active,
    Rejected,
}

impl SceneConfigStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SceneConfigStatus::Proposed => "proposed",
            SceneConfigStatus::Active => "active",
            SceneConfigStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for SceneConfigStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(SceneConfigStatus::Proposed),
            "active" => Ok(SceneConfigStatus::Active),
            "rejected" => Ok(SceneConfigStatus::Rejected),
            other => Err(format!("unknown scene config status: {other}")),
        }
    }
}

/// A scene definition as stored: characters, prompt template, vote standing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// System prompt template with `{placeholder}` variables filled per turn.
    pub system_prompt: String,
    pub start_character_id: String,
    pub characters: BTreeMap<String, CharacterConfig>,
    pub status: SceneConfigStatus,
    #[serde(default)]
    pub votes: i64,
    #[serde(default)]
    pub proposer_name: Option<String>,
    #[serde(default)]
    pub proposed_at: Option<String>,
}

/// One instantiated run of a scene config: the immutable config plus the
/// single live conversation state for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub config: SceneConfig,
    pub state: SceneState,
}

impl Scene {
    /// Fresh state for a config: characters at their initial placement,
    /// empty log, active only while someone is watching.
    pub fn new(scene_id: i64, config: SceneConfig, viewer_count: usize) -> Self {
        let started_at = unix_now();
        let characters = config
            .characters
            .iter()
            .map(|(id, character)| (id.clone(), CharacterState::from_config(character, started_at)))
            .collect();
        let state = SceneState {
            scene_id,
            scene_config_id: config.id,
            characters,
            messages: Vec::new(),
            started_at,
            conversation_active: viewer_count > 0,
            conversation_ended: false,
            ended_at: None,
            viewer_count,
        };
        Self { config, state }
    }
}

/// Structured output one completion call must produce for a character turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterReply {
    pub recipient: String,
    #[serde(default)]
    pub reaction_on_previous_message: Option<String>,
    #[serde(default)]
    pub conversation_rating: Option<u8>,
    pub mood: String,
    pub mood_emoji: String,
    pub thoughts: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub end_conversation: bool,
}

/// Outbound event pushed to viewers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SceneEvent {
    SceneState(SceneState),
}

impl SceneEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SceneEvent::SceneState(_) => "scene_state",
        }
    }
}

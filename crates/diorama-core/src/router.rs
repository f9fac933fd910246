//! Maps character language-model bindings to reusable completion handles.
//! Characters whose bindings are structurally equal share one handle.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use diorama_provider::{ChatMessage, ChatRequest, LlmProvider, ProviderRegistry};
use diorama_schema::{CharacterReply, LlmBinding, SceneConfig};

use crate::error::{EngineError, GenerateError};

/// Structural identity of a binding: provider, model, temperature, and
/// output size. Temperature is keyed by its bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindingKey {
    provider: String,
    model: String,
    temperature_bits: u64,
    max_tokens: u32,
}

impl From<&LlmBinding> for BindingKey {
    fn from(binding: &LlmBinding) -> Self {
        Self {
            provider: binding.provider.clone(),
            model: binding.model.clone(),
            temperature_bits: binding.temperature.to_bits(),
            max_tokens: binding.max_tokens,
        }
    }
}

/// Appended to every system prompt so the completion answers with the
/// structured reply the engine can apply.
const FORMAT_INSTRUCTIONS: &str = r#"Respond with a single JSON object and nothing else, with exactly these fields:
{
  "recipient": string (who your message is addressed to),
  "reaction_on_previous_message": string or null (a single unicode emoji reacting to the previous message),
  "conversation_rating": integer 1-10 or null (your rating of the conversation so far),
  "mood": string (a descriptive word or short phrase for your current emotional state),
  "mood_emoji": string (a single unicode emoji that best represents your mood),
  "thoughts": string (your inner thoughts; casual formatting and CAPS for emphasis allowed, absolutely no emojis),
  "content": string or null (your spoken response; casual formatting, absolutely no emojis),
  "end_conversation": boolean (true if your response ends the conversation)
}"#;

/// One reusable completion capability for a specific binding.
pub struct CompletionHandle {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

impl CompletionHandle {
    /// Issue one completion request and parse the structured character
    /// reply out of its text.
    pub async fn generate(
        &self,
        system: &str,
        history: Vec<ChatMessage>,
        input: &str,
    ) -> Result<CharacterReply, GenerateError> {
        let mut messages = history;
        messages.push(ChatMessage::user(input));
        let request = ChatRequest {
            model: self.model.clone(),
            system: Some(format!("{system}\n\n{FORMAT_INSTRUCTIONS}")),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        let response = self.provider.chat(request).await?;
        parse_reply(&response.text)
    }
}

/// Extract the reply object from completion text, tolerating code fences and
/// prose around the JSON.
pub fn parse_reply(text: &str) -> Result<CharacterReply, GenerateError> {
    let trimmed = text.trim();
    let object = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => {
            return Err(GenerateError::MalformedReply(format!(
                "no JSON object in completion: {}",
                snippet(trimmed)
            )))
        }
    };
    serde_json::from_str(object)
        .map_err(|err| GenerateError::MalformedReply(format!("{err}: {}", snippet(object))))
}

fn snippet(text: &str) -> String {
    let mut out: String = text.chars().take(120).collect();
    if out.len() < text.len() {
        out.push('…');
    }
    out
}

/// Per-character completion handles for one scene, deduplicated by binding.
pub struct CompletionRouter {
    handles: HashMap<String, Arc<CompletionHandle>>,
}

impl CompletionRouter {
    /// Build one handle per distinct binding in the config. An unknown
    /// provider id is a configuration error.
    pub fn from_config(config: &SceneConfig, registry: &ProviderRegistry) -> Result<Self> {
        let mut by_binding: HashMap<BindingKey, Arc<CompletionHandle>> = HashMap::new();
        let mut handles = HashMap::new();

        for (char_id, character) in &config.characters {
            let key = BindingKey::from(&character.llm);
            let handle = match by_binding.get(&key) {
                Some(handle) => handle.clone(),
                None => {
                    let provider = registry
                        .get(&character.llm.provider)
                        .with_context(|| format!("binding for character {char_id}"))?;
                    let handle = Arc::new(CompletionHandle {
                        provider,
                        model: character.llm.model.clone(),
                        temperature: character.llm.temperature,
                        max_tokens: character.llm.max_tokens,
                    });
                    by_binding.insert(key, handle.clone());
                    handle
                }
            };
            handles.insert(char_id.clone(), handle);
        }

        Ok(Self { handles })
    }

    pub fn handle_for(&self, character_id: &str) -> Result<Arc<CompletionHandle>, EngineError> {
        self.handles
            .get(character_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownCharacter(character_id.to_string()))
    }
}

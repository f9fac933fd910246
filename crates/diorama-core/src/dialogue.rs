//! Dialogue generation for one character turn: prompt assembly, the
//! completion call, and the bounded retry envelope around it. The generator
//! mutates nothing; applying the produced message is the orchestrator's job.

use chrono::Local;
use diorama_provider::ChatMessage;
use diorama_schema::{unix_now, CharacterState, Message, Scene};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::GenerateError;
use crate::pacing::DialogueTuning;
use crate::router::CompletionRouter;

pub struct DialogueGenerator {
    router: CompletionRouter,
    tuning: DialogueTuning,
}

impl DialogueGenerator {
    pub fn new(router: CompletionRouter, tuning: DialogueTuning) -> Self {
        Self { router, tuning }
    }

    /// Produce exactly one new message for `speaker_id`, or fail terminally
    /// after exhausting retries. The caller must not substitute a message on
    /// failure.
    pub async fn generate(
        &self,
        scene: &Scene,
        speaker_id: &str,
        recipient: Option<&str>,
    ) -> Result<Message, GenerateError> {
        let speaker = scene
            .state
            .characters
            .get(speaker_id)
            .ok_or_else(|| crate::error::EngineError::UnknownCharacter(speaker_id.to_string()))
            .map_err(GenerateError::Contract)?;
        let handle = self.router.handle_for(speaker_id)?;

        let system = self.render_system(scene, speaker);
        let history = self.conversation_history(scene, speaker_id);
        let input = if scene.state.messages.is_empty() {
            "Start a conversation."
        } else {
            "Continue the conversation naturally."
        };
        debug!(speaker = speaker_id, ?recipient, turn = scene.state.messages.len(), "generating dialogue");

        let mut backoff = self.tuning.retry_backoff;
        let mut attempts = 0;
        let mut last: Option<GenerateError> = None;

        while attempts < self.tuning.max_attempts {
            attempts += 1;
            match handle.generate(&system, history.clone(), input).await {
                Ok(reply) => {
                    let content_len = reply
                        .content
                        .as_deref()
                        .map(|content| content.chars().count())
                        .unwrap_or(0);
                    let speaking_time = self.tuning.speaking_duration(content_len);
                    return Ok(Message {
                        character: speaker_id.to_string(),
                        recipient: Some(reply.recipient),
                        content: reply.content,
                        thoughts: reply.thoughts,
                        mood: reply.mood,
                        mood_emoji: reply.mood_emoji,
                        reaction_on_previous_message: reply.reaction_on_previous_message,
                        conversation_rating: reply.conversation_rating,
                        end_conversation: reply.end_conversation,
                        timestamp: Local::now().to_rfc3339(),
                        unix_timestamp: unix_now(),
                        calculated_speaking_time: speaking_time,
                    });
                }
                Err(err) => {
                    warn!(
                        speaker = speaker_id,
                        attempt = attempts,
                        max_attempts = self.tuning.max_attempts,
                        error = %err,
                        "dialogue generation attempt failed"
                    );
                    let retryable = err.is_retryable();
                    last = Some(err);
                    if !retryable || attempts == self.tuning.max_attempts {
                        break;
                    }
                    let jitter = self.tuning.retry_jitter.mul_f64(rand::random::<f64>());
                    sleep(backoff + jitter).await;
                    backoff *= 2;
                }
            }
        }

        Err(GenerateError::Exhausted {
            attempts,
            last: last
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }

    /// Render the scene's system template for one speaker.
    fn render_system(&self, scene: &Scene, speaker: &CharacterState) -> String {
        scene
            .config
            .system_prompt
            .replace("{character_name}", &speaker.name)
            .replace("{character_visual}", &speaker.visual)
            .replace("{character_role}", &speaker.role)
            .replace("{scene_description}", &scene_description(scene))
            .replace(
                "{conversation_length}",
                &scene.state.messages.len().to_string(),
            )
            .replace(
                "{current_time}",
                &Local::now().format("%I:%M %p").to_string(),
            )
    }

    /// The trailing context window as a two-party transcript: the speaker's
    /// own messages become assistant turns, everyone else's become user
    /// turns. Silent turns stand in as "...".
    fn conversation_history(&self, scene: &Scene, speaker_id: &str) -> Vec<ChatMessage> {
        let messages = &scene.state.messages;
        let window_start = messages.len().saturating_sub(self.tuning.context_window);
        messages[window_start..]
            .iter()
            .map(|message| {
                let content = message.content.as_deref().unwrap_or("...");
                if message.character == speaker_id {
                    ChatMessage::assistant(content)
                } else {
                    ChatMessage::user(content)
                }
            })
            .collect()
    }
}

/// Scene description handed to the prompt: the configured description plus a
/// visual roster of everyone present.
fn scene_description(scene: &Scene) -> String {
    let roster = scene
        .state
        .characters
        .values()
        .map(|character| format!("- {}", character.visual))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{}\n\nCharacters:\n{}", scene.config.description, roster)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use async_trait::async_trait;
    use diorama_provider::{
        ChatRequest, ChatResponse, ChatRole, LlmProvider, ProviderError, ProviderErrorKind,
        ProviderRegistry,
    };
    use diorama_schema::{
        CharacterAction, CharacterConfig, Direction, LlmBinding, Position, SceneConfig,
        SceneConfigStatus,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const REPLY_JSON: &str = r#"{"recipient":"alice","reaction_on_previous_message":null,"conversation_rating":6,"mood":"hopeful","mood_emoji":"🌼","thoughts":"flowers","content":"Lovely weather for ice cream!","end_conversation":false}"#;

    /// Fails the first `fail_times` calls with the given status, then
    /// answers with a fixed reply.
    struct FlakyProvider {
        calls: AtomicUsize,
        fail_times: usize,
        status: u16,
    }

    #[async_trait]
    impl LlmProvider for FlakyProvider {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                return Err(ProviderError::Api {
                    provider: "flaky",
                    status: self.status,
                    kind: ProviderErrorKind::from_status(self.status),
                    message: "scripted failure".into(),
                });
            }
            Ok(ChatResponse {
                text: REPLY_JSON.to_string(),
                input_tokens: None,
                output_tokens: None,
            })
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn character(id: &str) -> CharacterConfig {
        CharacterConfig {
            id: id.to_string(),
            name: id.to_uppercase(),
            color: "#333333".into(),
            role: "a test subject".into(),
            visual: format!("the {id} silhouette"),
            llm: LlmBinding {
                provider: "flaky".into(),
                model: "demo".into(),
                temperature: 0.7,
                max_tokens: 4096,
            },
            initial_position: Position { x: 0.0, y: 0.0 },
            initial_direction: Direction::Front,
            initial_action: CharacterAction::Idle,
            initial_mood: "neutral".into(),
        }
    }

    fn scene() -> Scene {
        let mut characters = BTreeMap::new();
        for id in ["alice", "bob"] {
            characters.insert(id.to_string(), character(id));
        }
        let config = SceneConfig {
            id: 1,
            name: "test".into(),
            description: "You are in an ice cream shop.".into(),
            system_prompt:
                "You are {character_name}. {character_visual}\n{character_role}\n{scene_description}\nTurn {conversation_length} at {current_time}."
                    .into(),
            start_character_id: "bob".into(),
            characters,
            status: SceneConfigStatus::Active,
            votes: 0,
            proposer_name: None,
            proposed_at: None,
        };
        Scene::new(1, config, 1)
    }

    fn generator(provider: Arc<dyn LlmProvider>) -> DialogueGenerator {
        let mut registry = ProviderRegistry::new();
        registry.register("flaky", provider);
        let router = CompletionRouter::from_config(&scene().config, &registry).unwrap();
        let tuning = DialogueTuning {
            retry_backoff: Duration::from_millis(5),
            retry_jitter: Duration::from_millis(1),
            ..DialogueTuning::default()
        };
        DialogueGenerator::new(router, tuning)
    }

    fn push_message(scene: &mut Scene, character: &str, content: Option<&str>) {
        scene.state.messages.push(Message {
            character: character.to_string(),
            recipient: None,
            content: content.map(|c| c.to_string()),
            thoughts: "...".into(),
            mood: "neutral".into(),
            mood_emoji: "🙂".into(),
            reaction_on_previous_message: None,
            conversation_rating: None,
            end_conversation: false,
            timestamp: "2026-01-01T00:00:00+00:00".into(),
            unix_timestamp: 0.0,
            calculated_speaking_time: 5.0,
        });
    }

    #[tokio::test]
    async fn success_after_two_retryable_failures() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_times: 2,
            status: 429,
        });
        let generator = generator(provider.clone());
        let scene = scene();

        let message = generator.generate(&scene, "bob", Some("alice")).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(message.character, "bob");
        assert_eq!(message.recipient.as_deref(), Some("alice"));
        // "Lovely weather for ice cream!" is 29 chars: 5.0 + 0.05 * 29
        assert!((message.calculated_speaking_time - 6.45).abs() < 1e-9);
        assert!(!message.end_conversation);
    }

    #[tokio::test]
    async fn three_failures_are_terminal() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_times: usize::MAX,
            status: 503,
        });
        let generator = generator(provider.clone());
        let scene = scene();

        let err = generator.generate(&scene, "bob", None).await.unwrap_err();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, GenerateError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn terminal_provider_error_fails_without_retry() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_times: usize::MAX,
            status: 400,
        });
        let generator = generator(provider.clone());
        let scene = scene();

        let err = generator.generate(&scene, "bob", None).await.unwrap_err();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, GenerateError::Exhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn unknown_speaker_is_a_contract_error() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_times: 0,
            status: 0,
        });
        let generator = generator(provider);
        let scene = scene();

        let err = generator.generate(&scene, "ghost", None).await.unwrap_err();
        assert!(matches!(
            err,
            GenerateError::Contract(EngineError::UnknownCharacter(_))
        ));
    }

    #[test]
    fn history_maps_speakers_to_two_party_roles() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_times: 0,
            status: 0,
        });
        let generator = generator(provider);
        let mut scene = scene();
        push_message(&mut scene, "bob", Some("hello"));
        push_message(&mut scene, "alice", None);
        push_message(&mut scene, "bob", Some("are you there?"));

        let history = generator.conversation_history(&scene, "bob");

        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, ChatRole::Assistant);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].role, ChatRole::User);
        assert_eq!(history[1].content, "...");
        assert_eq!(history[2].role, ChatRole::Assistant);

        let from_alice = generator.conversation_history(&scene, "alice");
        assert_eq!(from_alice[0].role, ChatRole::User);
        assert_eq!(from_alice[1].role, ChatRole::Assistant);
    }

    #[test]
    fn history_clips_to_the_context_window() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_times: 0,
            status: 0,
        });
        let generator = generator(provider);
        let mut scene = scene();
        for turn in 0..30 {
            let speaker = if turn % 2 == 0 { "bob" } else { "alice" };
            push_message(&mut scene, speaker, Some(&format!("line {turn}")));
        }

        let history = generator.conversation_history(&scene, "bob");
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].content, "line 10");
        assert_eq!(history[19].content, "line 29");
    }

    #[test]
    fn system_template_placeholders_are_filled() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            fail_times: 0,
            status: 0,
        });
        let generator = generator(provider);
        let mut scene = scene();
        push_message(&mut scene, "bob", Some("hello"));

        let speaker = scene.state.characters.get("alice").unwrap();
        let system = generator.render_system(&scene, speaker);

        assert!(system.contains("You are ALICE."));
        assert!(system.contains("the alice silhouette"));
        assert!(system.contains("You are in an ice cream shop."));
        assert!(system.contains("- the bob silhouette"));
        assert!(system.contains("Turn 1 at"));
        assert!(!system.contains('{'));
    }
}

//! Built-in fallback scene used whenever no proposed config wins a vote.

use std::collections::BTreeMap;

use diorama_schema::{
    CharacterAction, CharacterConfig, Direction, LlmBinding, Position, SceneConfig,
    SceneConfigStatus,
};

/// Scene coordinates are expressed in pixels; character placement in the
/// default scene is specified in tiles.
pub const TILE_SIZE: f64 = 48.0;

/// Row id the default config is seeded under.
pub const DEFAULT_CONFIG_ID: i64 = 1;

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// System prompt template rendered once per turn. Placeholders are filled by
/// the dialogue generator.
pub const SYSTEM_PROMPT: &str = "You are {character_name}.
{character_visual}

Your character role is described as follows:
```role
{character_role}
```

Scene description:
```scene
{scene_description}
```

Current conversation duration: {conversation_length} messages.
Time: {current_time}

IMPORTANT RULES:
1. Keep responses natural, 1-2 sentences
2. Choose a mood that matches your personality
3. Select an appropriate emoji for the mood
4. Stay in character at all times
5. Respond to the context of the conversation and your current situation";

fn default_binding() -> LlmBinding {
    LlmBinding {
        provider: "openai".to_string(),
        model: DEFAULT_MODEL.to_string(),
        temperature: 0.7,
        max_tokens: 4096,
    }
}

/// Two characters in an ice cream shop: a hopeful florist and a scientist in
/// a hurry. Bob opens the conversation.
pub fn default_scene_config() -> SceneConfig {
    let bob = CharacterConfig {
        id: "bob".to_string(),
        name: "Bob".to_string(),
        color: "#4A90E2".to_string(),
        role: "You are Bob, a man in his 30s who is romantically interested in the woman in front of you.
Key traits:
- Enjoys life with a positive attitude, a sense of humor and a fancy ice cream bowl
- Hopeful and optimistic about love
- Respectful but persistent in showing interest
- Works as a florist
- Enjoys discussing flowers and gardening"
            .to_string(),
        visual: "A man in his 30s with a beard and glasses.".to_string(),
        llm: default_binding(),
        initial_position: Position {
            x: TILE_SIZE * 7.5,
            y: TILE_SIZE * 7.5,
        },
        initial_direction: Direction::Right,
        initial_action: CharacterAction::Idle,
        initial_mood: "neutral".to_string(),
    };

    let alice = CharacterConfig {
        id: "alice".to_string(),
        name: "Alice".to_string(),
        color: "#E24A8F".to_string(),
        role: "You are Alice, a woman in her 20s who is focused on her career.
Key traits:
- Works as a research scientist
- Passionate about scientific discoveries
- Independent and career-driven
- Pragmatic and cynical
- Very busy and doesn't have time for socializing
- Has an important online meeting in five minutes and just wants to quickly grab an ice coffee
- Not interested in romantic relationships and not interested in love"
            .to_string(),
        visual: "A woman in her 20s with long hair and blue eyes.".to_string(),
        llm: default_binding(),
        initial_position: Position {
            x: TILE_SIZE * 9.5,
            y: TILE_SIZE * 7.5,
        },
        initial_direction: Direction::Front,
        initial_action: CharacterAction::Idle,
        initial_mood: "neutral".to_string(),
    };

    let mut characters = BTreeMap::new();
    characters.insert(bob.id.clone(), bob);
    characters.insert(alice.id.clone(), alice);

    SceneConfig {
        id: DEFAULT_CONFIG_ID,
        name: "Default Scene: Ice Cream Shop with Alice and Bob".to_string(),
        description: "You are in an ice cream shop. You are having a conversation with another character."
            .to_string(),
        system_prompt: SYSTEM_PROMPT.to_string(),
        start_character_id: "bob".to_string(),
        characters,
        status: SceneConfigStatus::Active,
        votes: 0,
        proposer_name: None,
        proposed_at: None,
    }
}

//! End-of-conversation consensus: a unanimous vote with per-vote timeout.
//! A character's "yes" decays after its validity window and must be renewed
//! by a later turn to count again.

use diorama_schema::SceneState;
use tracing::info;

/// One consensus pass. Expired requests are cleared before unanimity is
/// evaluated, so a vote older than its validity window never counts toward
/// ending the conversation. Returns whether the state changed so the caller
/// can broadcast.
pub fn resolve_end_requests(state: &mut SceneState, now: f64, default_validity: f64) -> bool {
    let mut changed = false;

    for character in state.characters.values_mut() {
        let expired = character.end_conversation_requested
            && character
                .end_conversation_requested_at
                .map(|at| {
                    let validity = character
                        .end_conversation_requested_validity
                        .unwrap_or(default_validity);
                    now - at > validity
                })
                .unwrap_or(false);
        if expired {
            character.end_conversation_requested = false;
            character.end_conversation_requested_at = None;
            character.end_conversation_requested_validity = None;
            changed = true;
        }
    }

    let unanimous = !state.characters.is_empty()
        && state
            .characters
            .values()
            .all(|character| character.end_conversation_requested);
    if unanimous {
        state.conversation_active = false;
        state.conversation_ended = true;
        state.ended_at = Some(now);
        changed = true;
        info!("all characters agreed to end the conversation");
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use diorama_schema::{
        CharacterAction, CharacterConfig, CharacterState, Direction, LlmBinding, Position,
    };
    use std::collections::BTreeMap;

    const VALIDITY: f64 = 180.0;

    fn character(id: &str) -> CharacterState {
        let config = CharacterConfig {
            id: id.to_string(),
            name: id.to_uppercase(),
            color: "#333333".into(),
            role: "a test subject".into(),
            visual: "a silhouette".into(),
            llm: LlmBinding {
                provider: "openai".into(),
                model: "gpt-4o-mini".into(),
                temperature: 0.7,
                max_tokens: 4096,
            },
            initial_position: Position { x: 0.0, y: 0.0 },
            initial_direction: Direction::Front,
            initial_action: CharacterAction::Idle,
            initial_mood: "neutral".into(),
        };
        CharacterState::from_config(&config, 0.0)
    }

    fn state_with(ids: &[&str]) -> SceneState {
        let characters: BTreeMap<String, CharacterState> = ids
            .iter()
            .map(|id| (id.to_string(), character(id)))
            .collect();
        SceneState {
            scene_id: 1,
            scene_config_id: 1,
            characters,
            messages: Vec::new(),
            started_at: 0.0,
            conversation_active: true,
            conversation_ended: false,
            ended_at: None,
            viewer_count: 1,
        }
    }

    fn request_end(state: &mut SceneState, id: &str, at: f64) {
        let character = state.characters.get_mut(id).unwrap();
        character.end_conversation_requested = true;
        character.end_conversation_requested_at = Some(at);
        character.end_conversation_requested_validity = Some(VALIDITY);
    }

    #[test]
    fn unanimous_unexpired_votes_end_the_conversation() {
        let mut state = state_with(&["alice", "bob"]);
        request_end(&mut state, "alice", 1000.0);
        request_end(&mut state, "bob", 1100.0);

        let changed = resolve_end_requests(&mut state, 1150.0, VALIDITY);

        assert!(changed);
        assert!(state.conversation_ended);
        assert!(!state.conversation_active);
        assert_eq!(state.ended_at, Some(1150.0));
    }

    #[test]
    fn expired_vote_is_cleared_before_the_unanimity_check() {
        let mut state = state_with(&["alice", "bob"]);
        request_end(&mut state, "alice", 1000.0);
        request_end(&mut state, "bob", 1300.0);

        // Alice's vote is 181s past the window at check time.
        let changed = resolve_end_requests(&mut state, 1181.1, VALIDITY);

        assert!(changed);
        assert!(!state.conversation_ended);
        assert!(state.conversation_active);
        let alice = &state.characters["alice"];
        assert!(!alice.end_conversation_requested);
        assert!(alice.end_conversation_requested_at.is_none());
        assert!(state.characters["bob"].end_conversation_requested);
    }

    #[test]
    fn renewed_vote_counts_again() {
        let mut state = state_with(&["alice", "bob"]);
        request_end(&mut state, "alice", 1000.0);
        request_end(&mut state, "bob", 1000.0);
        assert!(resolve_end_requests(&mut state, 1500.0, VALIDITY));
        assert!(!state.conversation_ended);

        // Both renew within the window of the next check.
        request_end(&mut state, "alice", 1500.0);
        request_end(&mut state, "bob", 1600.0);
        assert!(resolve_end_requests(&mut state, 1650.0, VALIDITY));
        assert!(state.conversation_ended);
    }

    #[test]
    fn no_votes_means_no_change() {
        let mut state = state_with(&["alice", "bob"]);
        assert!(!resolve_end_requests(&mut state, 1000.0, VALIDITY));
        assert!(!state.conversation_ended);
        assert!(state.conversation_active);
    }

    #[test]
    fn partial_agreement_does_not_end() {
        let mut state = state_with(&["alice", "bob", "carol"]);
        request_end(&mut state, "alice", 1000.0);
        request_end(&mut state, "bob", 1000.0);

        assert!(!resolve_end_requests(&mut state, 1010.0, VALIDITY));
        assert!(!state.conversation_ended);
    }
}

//! Speaker selection: pure functions over the character set and an injected
//! random source, so alternation is deterministic under a seeded rng.

use diorama_schema::SceneState;
use rand::seq::SliceRandom;
use rand::Rng;

/// Uniform pick among all character ids except `exclude`. `None` when no
/// other character exists.
pub fn other_character<R: Rng>(state: &SceneState, exclude: &str, rng: &mut R) -> Option<String> {
    let candidates: Vec<&String> = state
        .characters
        .keys()
        .filter(|id| id.as_str() != exclude)
        .collect();
    candidates.choose(rng).map(|id| (*id).clone())
}

/// The first turn goes to the configured opener; every later turn moves away
/// from whoever spoke last.
pub fn next_speaker<R: Rng>(
    state: &SceneState,
    start_character_id: &str,
    rng: &mut R,
) -> Option<String> {
    match state.messages.last() {
        None => Some(start_character_id.to_string()),
        Some(last) => other_character(state, &last.character, rng),
    }
}

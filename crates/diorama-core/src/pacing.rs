use std::time::Duration;

/// Timing of the orchestrator loop. The intervals are part of the observable
/// cadence viewers expect, not tuning headroom; tests shrink them.
#[derive(Debug, Clone)]
pub struct LoopPacing {
    /// Engagement pause after a character finishes speaking.
    pub base_pause: Duration,
    /// Seconds after a conversation ends before the next scene loads.
    pub new_conversation_cooldown: f64,
    /// Sleep after a completed turn, bounding the loop iteration rate.
    pub turn_tick: Duration,
    /// Poll interval while the conversation is paused.
    pub paused_poll: Duration,
    /// Back-off after a turn fails terminally.
    pub turn_failure_backoff: Duration,
}

impl Default for LoopPacing {
    fn default() -> Self {
        Self {
            base_pause: Duration::from_secs(5),
            new_conversation_cooldown: 600.0,
            turn_tick: Duration::from_millis(100),
            paused_poll: Duration::from_secs(1),
            turn_failure_backoff: Duration::from_secs(5),
        }
    }
}

/// Knobs of the dialogue generator: context assembly, speaking-time model,
/// and the retry envelope around the completion call.
#[derive(Debug, Clone)]
pub struct DialogueTuning {
    /// Number of trailing messages included as conversation history.
    pub context_window: usize,
    /// Seconds an end-conversation vote stays counted without renewal.
    pub end_request_validity: f64,
    /// Floor of the simulated speaking time, in seconds.
    pub base_speaking_time: f64,
    /// Additional speaking seconds per character of spoken content.
    pub char_speaking_time: f64,
    /// Completion attempts before a turn fails terminally.
    pub max_attempts: usize,
    /// First retry delay; doubles on every subsequent retry.
    pub retry_backoff: Duration,
    /// Upper bound of the uniform jitter added to each retry delay.
    pub retry_jitter: Duration,
}

impl Default for DialogueTuning {
    fn default() -> Self {
        Self {
            context_window: 20,
            end_request_validity: 180.0,
            base_speaking_time: 5.0,
            char_speaking_time: 0.05,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
            retry_jitter: Duration::from_millis(100),
        }
    }
}

impl DialogueTuning {
    /// How long a character visibly occupies the speaking state for a spoken
    /// line of the given length.
    pub fn speaking_duration(&self, content_len: usize) -> f64 {
        self.base_speaking_time + content_len as f64 * self.char_speaking_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaking_duration_is_linear_in_content_length() {
        let tuning = DialogueTuning::default();
        assert_eq!(tuning.speaking_duration(0), 5.0);
        assert_eq!(tuning.speaking_duration(100), 10.0);
        assert_eq!(tuning.speaking_duration(40), 7.0);
    }

    #[test]
    fn default_pacing_matches_expected_cadence() {
        let pacing = LoopPacing::default();
        assert_eq!(pacing.base_pause, Duration::from_secs(5));
        assert_eq!(pacing.new_conversation_cooldown, 600.0);
        assert_eq!(pacing.turn_tick, Duration::from_millis(100));
        assert_eq!(pacing.paused_poll, Duration::from_secs(1));

        let tuning = DialogueTuning::default();
        assert_eq!(tuning.context_window, 20);
        assert_eq!(tuning.end_request_validity, 180.0);
        assert_eq!(tuning.max_attempts, 3);
        assert_eq!(tuning.retry_backoff, Duration::from_millis(500));
    }
}

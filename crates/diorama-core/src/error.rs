use diorama_provider::ProviderError;
use thiserror::Error;

/// Contract and lifecycle errors of the scene engine. None of these are
/// retried: a config that cannot be resolved is fatal at load, and the
/// remaining variants indicate a caller bug.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no scene config could be resolved: {0}")]
    ConfigResolution(String),
    #[error("failed to persist scene record: {0}")]
    Store(String),
    #[error("no active scene")]
    NoScene,
    #[error("unknown character id: {0}")]
    UnknownCharacter(String),
    #[error("scene needs at least two characters to converse")]
    TooFewCharacters,
    #[error("orchestrator is no longer running")]
    Stopped,
}

/// Outcome of a single dialogue-generation request. `Exhausted` is the only
/// variant the orchestrator ever sees; the others feed the retry loop.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("completion output is not a valid character reply: {0}")]
    MalformedReply(String),
    #[error(transparent)]
    Contract(#[from] EngineError),
    #[error("dialogue generation failed after {attempts} attempt(s): {last}")]
    Exhausted { attempts: usize, last: String },
}

impl GenerateError {
    /// Whether another attempt against the same binding can plausibly
    /// succeed. Malformed structured output is retryable: the model may
    /// produce valid JSON next time.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerateError::Provider(err) => err.is_retryable(),
            GenerateError::MalformedReply(_) => true,
            GenerateError::Contract(_) | GenerateError::Exhausted { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diorama_provider::ProviderErrorKind;

    #[test]
    fn retryability_per_variant() {
        let rate_limited = GenerateError::Provider(ProviderError::Api {
            provider: "openai",
            status: 429,
            kind: ProviderErrorKind::RateLimit,
            message: "slow down".into(),
        });
        assert!(rate_limited.is_retryable());

        let unauthorized = GenerateError::Provider(ProviderError::Api {
            provider: "openai",
            status: 401,
            kind: ProviderErrorKind::AuthError,
            message: "bad key".into(),
        });
        assert!(!unauthorized.is_retryable());

        assert!(GenerateError::MalformedReply("not json".into()).is_retryable());
        assert!(!GenerateError::Contract(EngineError::NoScene).is_retryable());
        assert!(!GenerateError::Exhausted {
            attempts: 3,
            last: "rate limited".into()
        }
        .is_retryable());
    }
}

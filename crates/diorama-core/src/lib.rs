//! Scene conversation engine: turn scheduling, dialogue generation with a
//! bounded retry envelope, end-of-conversation consensus, and snapshot-based
//! recovery for the single active scene.

pub mod consensus;
pub mod dialogue;
pub mod error;
pub mod orchestrator;
pub mod pacing;
pub mod router;
pub mod turns;

pub use dialogue::DialogueGenerator;
pub use error::{EngineError, GenerateError};
pub use orchestrator::{Command, OrchestratorHandle, SceneOrchestrator};
pub use pacing::{DialogueTuning, LoopPacing};
pub use router::{CompletionHandle, CompletionRouter};

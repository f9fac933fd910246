//! The scene orchestrator: a single cooperative task that exclusively owns
//! the active scene and runs the unending turn-taking loop. Other parts of
//! the process talk to it only through [`OrchestratorHandle`] commands,
//! which are serviced at the loop's suspension points.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use diorama_bus::ViewerHub;
use diorama_provider::ProviderRegistry;
use diorama_schema::{unix_now, CharacterAction, Scene, SceneEvent, SceneState};
use diorama_store::SqliteStore;

use crate::consensus;
use crate::dialogue::DialogueGenerator;
use crate::error::EngineError;
use crate::pacing::{DialogueTuning, LoopPacing};
use crate::router::CompletionRouter;
use crate::turns;

pub enum Command {
    AddViewer(String),
    RemoveViewer(String),
    LoadScene {
        config_id: Option<i64>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SceneState {
        reply: oneshot::Sender<Option<SceneState>>,
    },
}

/// Cheap-to-clone entry point into the orchestrator. Viewer membership
/// changes are plain sends, safe from connection teardown paths.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl OrchestratorHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn add_viewer(&self, viewer_id: impl Into<String>) {
        let _ = self.tx.send(Command::AddViewer(viewer_id.into()));
    }

    pub fn remove_viewer(&self, viewer_id: impl Into<String>) {
        let _ = self.tx.send(Command::RemoveViewer(viewer_id.into()));
    }

    /// Replace the active scene. `None` resolves the next config (highest
    /// voted proposal, else the default). Applied at the top of the loop,
    /// never in the middle of a turn.
    pub async fn load_scene(&self, config_id: Option<i64>) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::LoadScene { config_id, reply })
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    pub async fn scene_state(&self) -> Option<SceneState> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::SceneState { reply }).ok()?;
        rx.await.ok().flatten()
    }
}

pub struct SceneOrchestrator {
    store: Arc<SqliteStore>,
    hub: Arc<ViewerHub>,
    registry: Arc<ProviderRegistry>,
    pacing: LoopPacing,
    tuning: DialogueTuning,
    rng: StdRng,
    scene: Option<Scene>,
    generator: Option<DialogueGenerator>,
    viewers: HashSet<String>,
    pending_loads: Vec<(Option<i64>, oneshot::Sender<Result<(), EngineError>>)>,
}

impl SceneOrchestrator {
    pub fn new(
        store: Arc<SqliteStore>,
        hub: Arc<ViewerHub>,
        registry: Arc<ProviderRegistry>,
        pacing: LoopPacing,
        tuning: DialogueTuning,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            hub,
            registry,
            pacing,
            tuning,
            rng,
            scene: None,
            generator: None,
            viewers: HashSet::new(),
            pending_loads: Vec::new(),
        }
    }

    /// Drive the scheduling loop forever. Returns only when startup fails
    /// (no scene config resolvable), which is fatal for the process.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) -> Result<()> {
        self.startup().await.context("scene orchestrator startup")?;

        loop {
            while let Ok(command) = rx.try_recv() {
                self.handle_command(command).await;
            }
            self.service_pending_loads().await;

            let (active, ended, cooldown_over) = match &self.scene {
                Some(scene) => {
                    let state = &scene.state;
                    let cooldown_over = state.conversation_ended
                        && unix_now() - state.ended_at.unwrap_or(state.started_at)
                            >= self.pacing.new_conversation_cooldown;
                    (state.conversation_active, state.conversation_ended, cooldown_over)
                }
                None => return Err(EngineError::NoScene.into()),
            };

            if cooldown_over {
                info!("cooldown elapsed, loading the next scene");
                match self.load_scene_inner(None).await {
                    // load_scene_inner already took a snapshot
                    Ok(()) => self.emit(None, false).await,
                    Err(err) => {
                        error!(error = %err, "failed to load the next scene");
                        self.wait(&mut rx, self.pacing.turn_failure_backoff).await;
                    }
                }
                continue;
            }

            if active && !ended {
                match self.run_turn(&mut rx).await {
                    Ok(()) => self.wait(&mut rx, self.pacing.turn_tick).await,
                    Err(err) => {
                        error!(error = %err, "turn failed");
                        self.wait(&mut rx, self.pacing.turn_failure_backoff).await;
                    }
                }
            } else {
                self.wait(&mut rx, self.pacing.paused_poll).await;
            }
        }
    }

    /// Resume from the latest snapshot if one exists, otherwise load a
    /// freshly resolved scene. A snapshot that cannot be read counts as
    /// absent; a config that cannot be resolved is fatal.
    async fn startup(&mut self) -> Result<(), EngineError> {
        let restored = match self.store.load_latest().await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(error = %err, "failed to load latest snapshot, starting fresh");
                None
            }
        };

        match restored {
            Some((config, state)) => {
                let router = CompletionRouter::from_config(&config, &self.registry)
                    .map_err(|err| EngineError::ConfigResolution(format!("{err:#}")))?;
                self.generator = Some(DialogueGenerator::new(router, self.tuning.clone()));
                let mut scene = Scene { config, state };
                // Snapshot viewer counts are stale across restarts.
                scene.state.viewer_count = self.viewers.len();
                scene.state.conversation_active =
                    !scene.state.conversation_ended && scene.state.viewer_count > 0;
                info!(
                    scene_id = scene.state.scene_id,
                    messages = scene.state.messages.len(),
                    "resumed scene from snapshot"
                );
                self.scene = Some(scene);
                Ok(())
            }
            None => self.load_scene_inner(None).await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddViewer(viewer_id) => {
                self.viewers.insert(viewer_id.clone());
                self.recompute_activity();
                info!(viewer_id = %viewer_id, viewers = self.viewers.len(), "viewer joined");
                // Only the newcomer needs the state; others see no change
                // they care about until the next turn broadcast.
                self.emit(Some(&viewer_id), true).await;
            }
            Command::RemoveViewer(viewer_id) => {
                self.viewers.remove(&viewer_id);
                self.recompute_activity();
                info!(viewer_id = %viewer_id, viewers = self.viewers.len(), "viewer left");
                self.emit(None, true).await;
            }
            Command::LoadScene { config_id, reply } => {
                self.pending_loads.push((config_id, reply));
            }
            Command::SceneState { reply } => {
                let _ = reply.send(self.scene.as_ref().map(|scene| scene.state.clone()));
            }
        }
    }

    /// Scene replacement requested mid-turn is deferred here, at the top of
    /// the loop, so no turn is ever torn down halfway.
    async fn service_pending_loads(&mut self) {
        let pending = std::mem::take(&mut self.pending_loads);
        for (config_id, reply) in pending {
            let result = self.load_scene_inner(config_id).await;
            if result.is_ok() {
                self.emit(None, false).await;
            }
            let _ = reply.send(result);
        }
    }

    fn recompute_activity(&mut self) {
        if let Some(scene) = self.scene.as_mut() {
            scene.state.viewer_count = self.viewers.len();
            scene.state.conversation_active =
                !scene.state.conversation_ended && scene.state.viewer_count > 0;
        }
    }

    async fn load_scene_inner(&mut self, config_id: Option<i64>) -> Result<(), EngineError> {
        let config = match config_id {
            Some(id) => self
                .store
                .get_config(id)
                .await
                .map_err(|err| EngineError::Store(err.to_string()))?
                .ok_or_else(|| {
                    EngineError::ConfigResolution(format!("scene config {id} not found"))
                })?,
            None => self
                .store
                .next_scene_config()
                .await
                .map_err(|err| EngineError::ConfigResolution(err.to_string()))?,
        };

        let router = CompletionRouter::from_config(&config, &self.registry)
            .map_err(|err| EngineError::ConfigResolution(format!("{err:#}")))?;
        let scene_id = self
            .store
            .create_scene(config.id)
            .await
            .map_err(|err| EngineError::Store(err.to_string()))?;

        let scene = Scene::new(scene_id, config, self.viewers.len());
        if let Err(err) = self.store.save_snapshot(&scene.state).await {
            error!(error = %err, "failed to save initial scene snapshot");
        }
        info!(
            scene_id,
            config_id = scene.state.scene_config_id,
            name = %scene.config.name,
            "scene loaded"
        );
        self.generator = Some(DialogueGenerator::new(router, self.tuning.clone()));
        self.scene = Some(scene);
        Ok(())
    }

    /// One turn: let finished speakers settle, pick the next speaker and a
    /// recipient, generate the message, apply it, then run the consensus
    /// pass.
    async fn run_turn(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>) -> Result<()> {
        self.wait_for_speakers(rx).await?;

        // A command serviced during the wait may have paused things.
        let Some(scene) = self.scene.as_ref() else {
            return Err(EngineError::NoScene.into());
        };
        if !scene.state.conversation_active || scene.state.conversation_ended {
            return Ok(());
        }

        let start = scene.config.start_character_id.clone();
        let speaker = turns::next_speaker(&scene.state, &start, &mut self.rng)
            .ok_or(EngineError::TooFewCharacters)?;
        let recipient = turns::other_character(&scene.state, &speaker, &mut self.rng)
            .ok_or(EngineError::TooFewCharacters)?;
        let previous_mood = scene.state.messages.last().map(|message| message.mood.clone());

        self.set_action(
            &speaker,
            CharacterAction::thinking_about(previous_mood.as_deref()),
            None,
        )?;
        self.emit(None, true).await;

        let message = {
            let (Some(generator), Some(scene)) = (&self.generator, &self.scene) else {
                return Err(EngineError::NoScene.into());
            };
            generator.generate(scene, &speaker, Some(&recipient)).await?
        };

        let scene = self.scene.as_mut().ok_or(EngineError::NoScene)?;
        let character = scene
            .state
            .characters
            .get_mut(&speaker)
            .ok_or_else(|| EngineError::UnknownCharacter(speaker.clone()))?;
        character.current_mood = message.mood.clone();
        if message.end_conversation {
            character.end_conversation_requested = true;
            character.end_conversation_requested_at = Some(message.unix_timestamp);
            character.end_conversation_requested_validity = Some(self.tuning.end_request_validity);
        }
        character.action = CharacterAction::Speaking;
        character.action_started_at = message.unix_timestamp;
        character.action_estimated_duration = Some(message.calculated_speaking_time);
        debug!(
            speaker = %speaker,
            speaking_time = message.calculated_speaking_time,
            end_requested = message.end_conversation,
            "turn completed"
        );
        scene.state.messages.push(message);
        self.emit(None, true).await;

        let scene = self.scene.as_mut().ok_or(EngineError::NoScene)?;
        let changed =
            consensus::resolve_end_requests(&mut scene.state, unix_now(), self.tuning.end_request_validity);
        if changed {
            self.emit(None, true).await;
        }

        Ok(())
    }

    /// Wait out every speaking character's estimated duration, moving each
    /// to idle followed by the engagement pause, one transition broadcast at
    /// a time.
    async fn wait_for_speakers(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), EngineError> {
        let ids: Vec<String> = self
            .scene
            .as_ref()
            .ok_or(EngineError::NoScene)?
            .state
            .characters
            .keys()
            .cloned()
            .collect();

        for id in ids {
            let remaining = {
                let scene = self.scene.as_ref().ok_or(EngineError::NoScene)?;
                let Some(character) = scene.state.characters.get(&id) else {
                    continue;
                };
                if !character.action.is_speaking() {
                    continue;
                }
                let elapsed = unix_now() - character.action_started_at;
                character
                    .action_estimated_duration
                    .map(|duration| duration - elapsed)
                    .filter(|remaining| *remaining > 0.0)
            };
            if let Some(remaining) = remaining {
                debug!(character = %id, remaining, "waiting for speaker to finish");
                self.wait(rx, Duration::from_secs_f64(remaining)).await;
            }
            self.set_action(&id, CharacterAction::Idle, None)?;
            self.emit(None, true).await;
            self.wait(rx, self.pacing.base_pause).await;
        }
        Ok(())
    }

    fn set_action(
        &mut self,
        character_id: &str,
        action: CharacterAction,
        estimated_duration: Option<f64>,
    ) -> Result<(), EngineError> {
        let scene = self.scene.as_mut().ok_or(EngineError::NoScene)?;
        let character = scene
            .state
            .characters
            .get_mut(character_id)
            .ok_or_else(|| EngineError::UnknownCharacter(character_id.to_string()))?;
        character.action = action;
        character.action_started_at = unix_now();
        character.action_estimated_duration = estimated_duration;
        Ok(())
    }

    /// Persist a snapshot (unless suppressed) and push the current state to
    /// one viewer or all of them. A failed save is logged; the in-memory
    /// state stays authoritative and viewers still get the update.
    async fn emit(&mut self, target: Option<&str>, save_snapshot: bool) {
        let Some(scene) = self.scene.as_ref() else {
            return;
        };
        if save_snapshot {
            if let Err(err) = self.store.save_snapshot(&scene.state).await {
                error!(error = %err, "failed to save scene snapshot");
            }
        }
        let event = SceneEvent::SceneState(scene.state.clone());
        match target {
            Some(viewer_id) => self.hub.send_to(viewer_id, event).await,
            None => self.hub.broadcast(event).await,
        }
    }

    /// Cooperative sleep that keeps servicing commands. Viewer membership
    /// applies immediately; scene loads stay queued for the top of the loop.
    async fn wait(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                command = rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        sleep_until(deadline).await;
                        break;
                    }
                },
            }
        }
    }
}

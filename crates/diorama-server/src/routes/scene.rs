use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures_core::Stream;
use tracing::{debug, warn};
use uuid::Uuid;

use diorama_schema::{SceneEvent, SceneState};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/state", get(scene_state))
        .route("/stream", get(scene_stream))
}

async fn scene_state(State(state): State<AppState>) -> Result<Json<SceneState>, StatusCode> {
    state
        .orchestrator
        .scene_state()
        .await
        .map(Json)
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)
}

/// One SSE connection is one viewer. Joining registers the viewer with the
/// orchestrator, which answers with the current state as the first event;
/// dropping the stream removes the viewer again.
async fn scene_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let viewer_id = Uuid::new_v4().to_string();
    let mut rx = state.hub.subscribe(&viewer_id).await;
    state.orchestrator.add_viewer(viewer_id.clone());
    debug!(viewer_id = %viewer_id, "viewer stream opened");

    let guard = ViewerGuard {
        viewer_id,
        state: state.clone(),
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            let name = event.name();
            let SceneEvent::SceneState(snapshot) = event;
            match serde_json::to_string(&snapshot) {
                Ok(json) => yield Ok(Event::default().event(name).data(json)),
                Err(err) => warn!(error = %err, "failed to serialize scene state"),
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Deregisters the viewer when its SSE stream is dropped.
struct ViewerGuard {
    viewer_id: String,
    state: AppState,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        debug!(viewer_id = %self.viewer_id, "viewer stream closed");
        self.state.orchestrator.remove_viewer(self.viewer_id.clone());
        let hub = self.state.hub.clone();
        let viewer_id = self.viewer_id.clone();
        tokio::spawn(async move {
            hub.unsubscribe(&viewer_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{body::Body, http::Request};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tower::ServiceExt;

    use diorama_bus::ViewerHub;
    use diorama_core::{DialogueTuning, LoopPacing, OrchestratorHandle, SceneOrchestrator};
    use diorama_provider::{ProviderConfig, ProviderKind, ProviderRegistry};
    use diorama_store::SqliteStore;

    use crate::create_router;
    use crate::state::AppState;

    async fn setup_state() -> (AppState, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(&tmp.path().join("scene.db")).unwrap());
        let hub = Arc::new(ViewerHub::new(64));
        let registry = Arc::new(
            ProviderRegistry::from_configs(&[ProviderConfig::new("openai", ProviderKind::Stub)])
                .unwrap(),
        );

        let (handle, rx) = OrchestratorHandle::channel();
        let orchestrator = SceneOrchestrator::new(
            store,
            hub.clone(),
            registry,
            LoopPacing::default(),
            DialogueTuning::default(),
            StdRng::seed_from_u64(1),
        );
        tokio::spawn(async move {
            let _ = orchestrator.run(rx).await;
        });

        let state = AppState {
            orchestrator: handle,
            hub,
        };

        // Startup loads a scene asynchronously; wait for it to land.
        for _ in 0..100 {
            if state.orchestrator.scene_state().await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        (state, tmp)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (state, _tmp) = setup_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn scene_state_returns_the_loaded_scene() {
        let (state, _tmp) = setup_state().await;
        assert!(state.orchestrator.scene_state().await.is_some());
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/scene/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn scene_stream_is_served_as_sse() {
        let (state, _tmp) = setup_state().await;
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/scene/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/event-stream"));
    }
}

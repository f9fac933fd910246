use std::sync::Arc;

use diorama_bus::ViewerHub;
use diorama_core::OrchestratorHandle;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrchestratorHandle,
    pub hub: Arc<ViewerHub>,
}

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::{
    config::AppConfig, index::DocumentIndex, session::SessionOrchestrator, store::ProgressStore,
};

/// Estado compartido de la aplicación, clonable entre handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub index: Arc<DocumentIndex>,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub store: Arc<dyn ProgressStore>,
    pub status: Arc<Mutex<Status>>,
    /// Directorio elegido para la próxima ingesta en bloque.
    pub current_dir: Arc<Mutex<Option<PathBuf>>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

/// Estado observable de las tareas de fondo (ingesta de documentos).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
}

// Módulos de la aplicación
mod api;
mod app_state;
mod config;
mod error;
mod extract;
mod generator;
mod index;
mod llm;
mod mastery;
mod models;
mod progress;
mod rate_limiter;
mod retrieval;
mod session;
mod store;

use crate::app_state::{AppState, Status};
use axum::Router;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Inicializar gestor de LLMs y limitador de llamadas
    let llm = Arc::new(llm::LlmManager::from_config(&cfg).expect("Error inicializando LLM Manager"));
    let limiter = Arc::new(rate_limiter::RateLimiter::from_config(&cfg));

    // 4. Construir el motor: índice documental, generador y orquestador
    let index = Arc::new(index::DocumentIndex::new(&cfg, llm.clone()));
    let store: Arc<dyn store::ProgressStore> = Arc::new(store::MemoryStore::new());
    let generator = Arc::new(generator::QuestionGenerator::new(
        &cfg,
        llm.clone(),
        limiter.clone(),
    ));
    let orchestrator = Arc::new(session::SessionOrchestrator::new(
        &cfg,
        generator,
        index.clone(),
        store.clone(),
    ));

    // Crear canal para la señal de apagado.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    // 5. Crear estado compartido de la aplicación
    let app_state = AppState {
        config: cfg.clone(),
        index,
        orchestrator,
        store,
        status: Arc::new(Mutex::new(Status {
            is_busy: false,
            message: "Servidor listo.".to_string(),
            progress: 0.0,
        })),
        current_dir: Arc::new(Mutex::new(None)),
        shutdown_sender: Arc::new(Mutex::new(Some(shutdown_tx))),
    };

    // 6. Configurar el router de la API y el servicio de ficheros estáticos
    let frontend_dir = app_state.config.frontend_dir.clone();
    let app = Router::new()
        .nest("/", api::create_router(app_state.clone()))
        .fallback_service(ServeDir::new(frontend_dir))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 7. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .unwrap();
    let server_url = format!("http://{}", server_addr);
    info!("🚀 Servidor escuchando en {}", &server_url);

    // Abrir el frontend en el navegador por defecto
    if webbrowser::open(&server_url).is_err() {
        info!("No se pudo abrir el navegador. Por favor, accede a {} manualmente.", server_url);
    }

    // Configurar el apagado ordenado.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .unwrap();

    info!("✅ Servidor cerrado correctamente.");
}

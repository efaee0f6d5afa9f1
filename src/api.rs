use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::spawn;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    app_state::{AppState, Status},
    error::TutorError,
    extract::FileExtractor,
    models::{Difficulty, Document, IngestOutcome, Question, Session, SessionStatus},
    progress::{self, MergeStrategy, ProgressExport},
    session::AnswerOutcome,
};

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct SessionPayload {
    user: String,
    subject: String,
    topic: String,
}

#[derive(Deserialize)]
pub struct StartSessionPayload {
    user: String,
    subject: String,
    topic: String,
    /// Nivel inicial explícito; sin él manda el registro de maestría.
    difficulty: Option<Difficulty>,
    /// Documento sobre el que anclar las preguntas (opcional).
    document_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct AnswerPayload {
    user: String,
    subject: String,
    topic: String,
    answer: String,
    #[serde(default)]
    time_taken_secs: i64,
}

#[derive(Deserialize)]
pub struct IngestTextPayload {
    subject: String,
    title: String,
    text: String,
}

#[derive(Deserialize)]
pub struct SelectDirPayload {
    path: String,
}

#[derive(Deserialize)]
pub struct IngestDirPayload {
    subject: String,
}

#[derive(Deserialize)]
pub struct DeleteDocumentPayload {
    id: Uuid,
}

#[derive(Deserialize)]
pub struct ExportPayload {
    user: String,
}

#[derive(Deserialize)]
pub struct ImportPayload {
    user: String,
    strategy: MergeStrategy,
    /// Documento de exportación completo, tal y como lo produjo /export.
    data: serde_json::Value,
}

/// Pregunta tal y como viaja al cliente: sin la clave correcta ni la
/// explicación, que sólo se revelan al corregir.
#[derive(Serialize)]
pub struct QuestionView {
    id: Uuid,
    question: String,
    options: Option<BTreeMap<String, String>>,
    difficulty: Difficulty,
}

impl QuestionView {
    fn from_question(q: &Question) -> Self {
        Self {
            id: q.id,
            question: q.text.clone(),
            options: q.options.clone(),
            difficulty: q.difficulty,
        }
    }
}

/// Resultado de una corrección hacia el cliente; la siguiente pregunta viaja
/// ya sin su clave de respuesta.
#[derive(Serialize)]
pub struct AnswerView {
    is_correct: bool,
    score: f64,
    feedback: String,
    correct_answer: String,
    explanation: String,
    difficulty: Difficulty,
    difficulty_changed: bool,
    mastery_score: f64,
    questions_answered: u32,
    questions_remaining: u32,
    session_over: bool,
    next_question: Option<QuestionView>,
}

impl AnswerView {
    fn from_outcome(o: &AnswerOutcome) -> Self {
        Self {
            is_correct: o.is_correct,
            score: o.score,
            feedback: o.feedback.clone(),
            correct_answer: o.correct_answer.clone(),
            explanation: o.explanation.clone(),
            difficulty: o.difficulty,
            difficulty_changed: o.difficulty_changed,
            mastery_score: o.mastery_score,
            questions_answered: o.questions_answered,
            questions_remaining: o.questions_remaining,
            session_over: o.session_over,
            next_question: o.next_question.as_ref().map(QuestionView::from_question),
        }
    }
}

#[derive(Serialize)]
pub struct SessionView {
    id: Uuid,
    subject: String,
    topic: String,
    difficulty: Difficulty,
    status: SessionStatus,
    questions_answered: u32,
    questions_correct: u32,
    accuracy: f64,
    restart_count: u32,
    pending_question: Option<QuestionView>,
}

impl SessionView {
    fn from_session(s: &Session) -> Self {
        Self {
            id: s.id,
            subject: s.subject.clone(),
            topic: s.topic.clone(),
            difficulty: s.difficulty,
            status: s.status,
            questions_answered: s.questions_answered(),
            questions_correct: s.questions_correct(),
            accuracy: s.accuracy(),
            restart_count: s.restart_count,
            pending_question: s.pending_question.as_ref().map(QuestionView::from_question),
        }
    }
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/session/start", post(start_session_handler))
        .route("/api/session/question", post(next_question_handler))
        .route("/api/session/answer", post(submit_answer_handler))
        .route("/api/session/end", post(end_session_handler))
        .route("/api/session/status", post(session_status_handler))
        .route("/api/explain", post(explain_handler))
        .route("/api/documents", post(ingest_text_handler).get(list_documents_handler))
        .route("/api/documents/delete", post(delete_document_handler))
        .route("/api/select-directory", post(select_directory_handler))
        .route("/api/ingest", post(ingest_directory_handler))
        .route("/api/progress/export", post(export_progress_handler))
        .route("/api/progress/import", post(import_progress_handler))
        .route("/api/progress", post(list_progress_handler))
        .route("/api/status", get(status_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

/// Traduce un error de dominio a la respuesta JSON de la API.
fn error_response(err: TutorError) -> (StatusCode, Json<serde_json::Value>) {
    (err.status_code(), Json(json!({"error": err.to_string()})))
}

// --- Handlers de sesión ---

#[axum::debug_handler]
async fn start_session_handler(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionPayload>,
) -> Result<Json<SessionView>, (StatusCode, Json<serde_json::Value>)> {
    let session = state
        .orchestrator
        .start_session(
            &payload.user,
            &payload.subject,
            &payload.topic,
            payload.difficulty,
            payload.document_id,
        )
        .await
        .map_err(error_response)?;
    Ok(Json(SessionView::from_session(&session)))
}

#[axum::debug_handler]
async fn next_question_handler(
    State(state): State<AppState>,
    Json(payload): Json<SessionPayload>,
) -> Result<Json<QuestionView>, (StatusCode, Json<serde_json::Value>)> {
    let question = state
        .orchestrator
        .next_question(&payload.user, &payload.subject, &payload.topic)
        .await
        .map_err(error_response)?;
    Ok(Json(QuestionView::from_question(&question)))
}

#[axum::debug_handler]
async fn submit_answer_handler(
    State(state): State<AppState>,
    Json(payload): Json<AnswerPayload>,
) -> Result<Json<AnswerView>, (StatusCode, Json<serde_json::Value>)> {
    let outcome = state
        .orchestrator
        .submit_answer(
            &payload.user,
            &payload.subject,
            &payload.topic,
            &payload.answer,
            payload.time_taken_secs,
        )
        .await
        .map_err(error_response)?;
    Ok(Json(AnswerView::from_outcome(&outcome)))
}

#[axum::debug_handler]
async fn end_session_handler(
    State(state): State<AppState>,
    Json(payload): Json<SessionPayload>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let summary = state
        .orchestrator
        .end_session(&payload.user, &payload.subject, &payload.topic)
        .map_err(error_response)?;
    Ok(Json(summary))
}

#[axum::debug_handler]
async fn session_status_handler(
    State(state): State<AppState>,
    Json(payload): Json<SessionPayload>,
) -> Result<Json<SessionView>, (StatusCode, Json<serde_json::Value>)> {
    match state
        .orchestrator
        .session_snapshot(&payload.user, &payload.subject, &payload.topic)
    {
        Some(session) => Ok(Json(SessionView::from_session(&session))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "No hay sesión activa para ese usuario, asignatura y tema."})),
        )),
    }
}

#[axum::debug_handler]
async fn explain_handler(
    State(state): State<AppState>,
    Json(payload): Json<SessionPayload>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let explanation = state
        .orchestrator
        .explain(&payload.user, &payload.subject, &payload.topic)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({ "explanation": explanation })))
}

// --- Handlers de documentos ---

#[axum::debug_handler]
async fn ingest_text_handler(
    State(state): State<AppState>,
    Json(payload): Json<IngestTextPayload>,
) -> Result<Json<IngestOutcome>, (StatusCode, Json<serde_json::Value>)> {
    let outcome = state
        .index
        .ingest_document(&payload.subject, &payload.title, "api", &payload.text)
        .await
        .map_err(error_response)?;
    Ok(Json(outcome))
}

#[axum::debug_handler]
async fn list_documents_handler(State(state): State<AppState>) -> Json<Vec<Document>> {
    Json(state.index.list_documents())
}

#[axum::debug_handler]
async fn delete_document_handler(
    State(state): State<AppState>,
    Json(payload): Json<DeleteDocumentPayload>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if state.index.delete_document(payload.id) {
        Ok((StatusCode::OK, Json(json!({ "message": "Documento eliminado." }))))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "No existe ningún documento con ese identificador."})),
        ))
    }
}

#[axum::debug_handler]
async fn select_directory_handler(
    State(state): State<AppState>,
    Json(payload): Json<SelectDirPayload>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let path = PathBuf::from(&payload.path);
    if !path.is_dir() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "La ruta proporcionada no es un directorio válido."})),
        ));
    }

    *state.current_dir.lock().unwrap() = Some(path);
    Ok((StatusCode::OK, Json(json!({ "message": "Directorio fijado para la ingesta." }))))
}

#[axum::debug_handler]
async fn ingest_directory_handler(
    State(state): State<AppState>,
    Json(payload): Json<IngestDirPayload>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let root_dir = match state.current_dir.lock().unwrap().clone() {
        Some(dir) => dir,
        None => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Primero debe seleccionar un directorio."})),
            ));
        }
    };

    if state.status.lock().unwrap().is_busy {
        return Err((
            StatusCode::CONFLICT,
            Json(json!({"error": "Ya hay una ingesta en curso."})),
        ));
    }

    spawn(async move {
        {
            let mut status = state.status.lock().unwrap();
            status.is_busy = true;
            status.message = "Iniciando indexación...".to_string();
            status.progress = 0.0;
        }

        let result = state
            .index
            .ingest_directory(
                &FileExtractor,
                &payload.subject,
                &root_dir,
                state.status.clone(),
            )
            .await;

        let mut status = state.status.lock().unwrap();
        status.is_busy = false;
        status.progress = 0.0;
        match result {
            Ok(summary) => {
                status.message = format!("¡Indexación completada! {}", summary);
            }
            Err(err) => {
                status.message = format!("Error en la indexación: {}", err);
                error!("Error de ingesta: {}", err);
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

// --- Handlers de progreso ---

#[axum::debug_handler]
async fn export_progress_handler(
    State(state): State<AppState>,
    Json(payload): Json<ExportPayload>,
) -> Json<ProgressExport> {
    Json(progress::export_progress(state.store.as_ref(), &payload.user))
}

#[axum::debug_handler]
async fn import_progress_handler(
    State(state): State<AppState>,
    Json(payload): Json<ImportPayload>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let report = progress::import_progress(
        state.store.as_ref(),
        &payload.user,
        &payload.data.to_string(),
        payload.strategy,
    )
    .map_err(error_response)?;
    Ok(Json(report))
}

#[axum::debug_handler]
async fn list_progress_handler(
    State(state): State<AppState>,
    Json(payload): Json<ExportPayload>,
) -> Json<serde_json::Value> {
    let records = state.store.list_mastery(&payload.user);
    Json(json!({ "progress": records }))
}

// --- Estado y apagado ---

#[axum::debug_handler]
async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().unwrap().clone())
}

#[axum::debug_handler]
async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("Petición de apagado recibida.");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}

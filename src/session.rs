//! Orquestador de sesiones de estudio.
//!
//! Mantiene una sesión activa como máximo por (usuario, asignatura, tema) y
//! hace de puente entre la generación de preguntas, la corrección, la
//! política de maestría y la persistencia de progreso. Cada sesión vive tras
//! su propio mutex asíncrono: una segunda operación concurrente sobre la
//! misma sesión no se encola, se rechaza con un error de estado.
//!
//! El ciclo normal es: `start_session` genera la primera pregunta;
//! `submit_answer` corrige, actualiza la maestría y genera la siguiente, y
//! cuando se alcanza el cupo de preguntas o la duración máxima la sesión
//! pasa a `Expired` en vez de pedir otra pregunta.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{Result, TutorError};
use crate::generator::{QuestionGenerator, QuestionRequest};
use crate::index::DocumentIndex;
use crate::mastery::MasteryPolicy;
use crate::models::{
    Difficulty, DifficultyChange, MasteryRecord, Question, QuestionAttempt, Session,
    SessionEvent, SessionStatus, SessionSummary,
};
use crate::store::ProgressStore;

/// Caracteres vetados en los campos de texto del usuario.
const DANGEROUS_CHARS: [char; 6] = ['<', '>', '"', '\'', ';', '\\'];

/// Resultado de corregir una respuesta.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerOutcome {
    pub is_correct: bool,
    /// Puntuación en [0,1]; admite crédito parcial en preguntas abiertas.
    pub score: f64,
    pub feedback: String,
    pub correct_answer: String,
    pub explanation: String,
    pub difficulty: Difficulty,
    pub difficulty_changed: bool,
    pub mastery_score: f64,
    pub questions_answered: u32,
    pub questions_remaining: u32,
    /// true si la sesión terminó con esta respuesta (cupo o duración).
    pub session_over: bool,
    /// Siguiente pregunta, ya generada. `None` si la sesión terminó o si la
    /// generación falló (en cuyo caso `next_question` permite reintentar).
    pub next_question: Option<Question>,
}

struct SessionSlot {
    session: AsyncMutex<Session>,
}

type SessionKey = (String, String, String);

pub struct SessionOrchestrator {
    generator: Arc<QuestionGenerator>,
    index: Arc<DocumentIndex>,
    policy: MasteryPolicy,
    store: Arc<dyn ProgressStore>,

    session_duration: Duration,
    questions_per_session: u32,
    retrieval_top_k: usize,
    recent_questions: usize,
    max_subject_chars: usize,
    max_topic_chars: usize,

    /// Sesiones activas. El mutex exterior sólo protege el mapa y nunca se
    /// mantiene a través de un await.
    sessions: Mutex<HashMap<SessionKey, Arc<SessionSlot>>>,
}

impl SessionOrchestrator {
    pub fn new(
        cfg: &AppConfig,
        generator: Arc<QuestionGenerator>,
        index: Arc<DocumentIndex>,
        store: Arc<dyn ProgressStore>,
    ) -> Self {
        Self {
            generator,
            index,
            policy: MasteryPolicy::from_config(cfg),
            store,
            session_duration: cfg.session_duration,
            questions_per_session: cfg.questions_per_session,
            retrieval_top_k: cfg.retrieval_top_k,
            recent_questions: cfg.recent_questions,
            max_subject_chars: cfg.max_subject_chars,
            max_topic_chars: cfg.max_topic_chars,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    // ---------------------------------------------------------------------
    // CICLO DE VIDA DE LA SESIÓN
    // ---------------------------------------------------------------------

    /// Arranca una sesión y genera su primera pregunta. Si ya había una
    /// activa para (usuario, asignatura, tema), la archiva como abortada y
    /// arranca otra: el reinicio nunca destruye el histórico ni la maestría.
    ///
    /// Sin `difficulty` explícita se arranca al nivel que diga el registro
    /// de maestría (Beginner si no existe).
    pub async fn start_session(
        &self,
        user: &str,
        subject: &str,
        topic: &str,
        difficulty: Option<Difficulty>,
        document_scope: Option<Uuid>,
    ) -> Result<Session> {
        let user = validate_field(user, self.max_subject_chars, "usuario")?;
        let subject = validate_field(subject, self.max_subject_chars, "asignatura")?;
        let topic = validate_field(topic, self.max_topic_chars, "tema")?;
        let key = (user.clone(), subject.clone(), topic.clone());

        // Reinicio: archivar la sesión activa previa si existe.
        let previous = self.sessions.lock().unwrap().get(&key).cloned();
        let mut restart_count = 0;
        if let Some(slot) = previous {
            let mut session = slot.session.try_lock().map_err(|_| {
                TutorError::State("otra operación está en curso sobre la sesión".to_string())
            })?;
            restart_count = session.restart_count + 1;
            self.archive(&mut session, true);
            // Fuera del mapa ya: si la generación de la primera pregunta de
            // la sesión nueva falla, no debe quedar un hueco archivado.
            self.sessions.lock().unwrap().remove(&key);
            info!(
                "Sesión {} reiniciada ({} reinicios acumulados)",
                session.id, restart_count
            );
        }

        let record = self.store.load_mastery(&user, &subject, &topic);
        let difficulty = match difficulty {
            Some(requested) => {
                // Un nivel elegido a mano pasa a ser el nivel de referencia
                // del registro de maestría; las rachas parten de cero.
                if let Some(mut record) = record {
                    if record.difficulty != requested {
                        record.difficulty = requested;
                        record.consecutive_correct = 0;
                        record.consecutive_incorrect = 0;
                        self.store.upsert_mastery(record);
                    }
                }
                requested
            }
            None => record.map(|r| r.difficulty).unwrap_or(Difficulty::Beginner),
        };

        let mut session = Session {
            id: Uuid::new_v4(),
            user: user.clone(),
            subject: subject.clone(),
            topic: topic.clone(),
            difficulty,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            attempts: Vec::new(),
            pending_question: None,
            document_scope,
            restart_count,
            difficulty_changes: Vec::new(),
        };

        // La primera pregunta se genera antes de dar la sesión por creada:
        // si el LLM no coopera, no queda una sesión activa a medias.
        self.generate_question(&mut session).await?;

        self.store.append_event(SessionEvent::SessionStarted {
            session_id: session.id,
            user,
            subject,
            topic,
            difficulty,
            timestamp: session.started_at,
        });

        {
            let mut sessions = self.sessions.lock().unwrap();
            // Otro arranque concurrente pudo registrar una sesión para esta
            // clave mientras se generaba la primera pregunta: se archiva como
            // abortada en vez de pisarla en silencio.
            if let Some(stale) = sessions.remove(&key) {
                match stale.session.try_lock() {
                    Ok(mut other) => self.archive(&mut other, true),
                    Err(_) => warn!(
                        "Sesión concurrente en uso para {} / {} / {}; se sustituye sin archivar",
                        key.0, key.1, key.2
                    ),
                }
            }
            sessions.insert(
                key,
                Arc::new(SessionSlot {
                    session: AsyncMutex::new(session.clone()),
                }),
            );
        }
        Ok(session)
    }

    /// Termina la sesión explícitamente y devuelve su resumen.
    pub fn end_session(&self, user: &str, subject: &str, topic: &str) -> Result<SessionSummary> {
        let key = self.key(user, subject, topic);
        let slot = self.slot(&key)?;
        let mut session = slot.session.try_lock().map_err(|_| {
            TutorError::State("otra operación está en curso sobre la sesión".to_string())
        })?;

        self.archive(&mut session, false);
        self.sessions.lock().unwrap().remove(&key);
        Ok(SessionSummary::from_session(&session))
    }

    /// Instantánea de la sesión activa, si la hay.
    pub fn session_snapshot(&self, user: &str, subject: &str, topic: &str) -> Option<Session> {
        let key = self.key(user, subject, topic);
        let slot = self.sessions.lock().unwrap().get(&key).cloned()?;
        let session = slot.session.try_lock().ok()?;
        Some(session.clone())
    }

    // ---------------------------------------------------------------------
    // PREGUNTAS Y RESPUESTAS
    // ---------------------------------------------------------------------

    /// Re-entrega la pregunta pendiente, o genera una nueva si la última
    /// generación falló y la sesión se quedó sin pregunta.
    pub async fn next_question(&self, user: &str, subject: &str, topic: &str) -> Result<Question> {
        let key = self.key(user, subject, topic);
        let slot = self.slot(&key)?;
        let mut session = slot.session.try_lock().map_err(|_| {
            TutorError::State("otra operación está en curso sobre la sesión".to_string())
        })?;

        self.check_wall_clock(&key, &mut session)?;

        if let Some(pending) = &session.pending_question {
            return Ok(pending.clone());
        }
        self.generate_question(&mut session).await
    }

    /// Corrige la respuesta a la pregunta pendiente, actualiza la maestría
    /// y genera la siguiente pregunta, salvo que la sesión haya alcanzado
    /// sus límites (cupo de preguntas o duración), en cuyo caso expira.
    pub async fn submit_answer(
        &self,
        user: &str,
        subject: &str,
        topic: &str,
        answer: &str,
        time_taken_secs: i64,
    ) -> Result<AnswerOutcome> {
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(TutorError::InvalidInput(
                "La respuesta no puede estar vacía".to_string(),
            ));
        }
        if answer.chars().any(|c| DANGEROUS_CHARS.contains(&c)) {
            return Err(TutorError::InvalidInput(
                "La respuesta contiene caracteres no permitidos".to_string(),
            ));
        }

        let key = self.key(user, subject, topic);
        let slot = self.slot(&key)?;
        let mut session = slot.session.try_lock().map_err(|_| {
            TutorError::State("otra operación está en curso sobre la sesión".to_string())
        })?;

        self.check_wall_clock(&key, &mut session)?;

        let question = session.pending_question.take().ok_or_else(|| {
            TutorError::State("no hay ninguna pregunta pendiente de respuesta".to_string())
        })?;

        let (is_correct, score, feedback) = self.grade(&session.user, &question, answer).await;

        let attempt_difficulty = session.difficulty;
        let answered_at = Utc::now();
        session.attempts.push(QuestionAttempt {
            question_id: question.id,
            question_text: question.text.clone(),
            user_answer: answer.to_string(),
            is_correct,
            score,
            feedback: Some(feedback.clone()),
            time_taken_secs,
            difficulty: attempt_difficulty,
            answered_at,
        });

        self.store.append_event(SessionEvent::AnswerGraded {
            session_id: session.id,
            question_id: question.id,
            is_correct,
            score,
            timestamp: Utc::now(),
        });

        // --- Maestría y adaptación de dificultad ---
        let mut record = self
            .store
            .load_mastery(&session.user, &session.subject, &session.topic)
            .unwrap_or_else(|| {
                MasteryRecord::new(
                    &session.user,
                    &session.subject,
                    &session.topic,
                    session.difficulty,
                )
            });
        let update = self.policy.evaluate(&mut record, is_correct);

        self.store.append_event(SessionEvent::MasteryUpdated {
            user: session.user.clone(),
            subject: session.subject.clone(),
            topic: session.topic.clone(),
            score: update.score,
            difficulty: update.difficulty,
            timestamp: Utc::now(),
        });
        self.store.upsert_mastery(record);

        if update.difficulty_changed {
            let change = DifficultyChange {
                from: session.difficulty,
                to: update.difficulty,
                at_question: session.questions_answered(),
                timestamp: Utc::now(),
            };
            info!(
                "Dificultad de la sesión {} ajustada: {} -> {}",
                session.id, change.from, change.to
            );
            self.store.append_event(SessionEvent::DifficultyChanged {
                session_id: session.id,
                from: change.from,
                to: change.to,
                timestamp: change.timestamp,
            });
            session.difficulty_changes.push(change);
            session.difficulty = update.difficulty;
        }

        // --- Límites de sesión ---
        let answered = session.questions_answered();
        let elapsed = (Utc::now() - session.started_at).num_seconds();
        let session_over = answered >= self.questions_per_session
            || elapsed >= self.session_duration.as_secs() as i64;

        let mut next_question = None;
        if session_over {
            self.expire(&key, &mut session);
        } else {
            // Un fallo generando la siguiente pregunta no invalida la
            // corrección ya aplicada: la sesión queda sin pregunta pendiente
            // y `next_question` sirve para reintentar.
            match self.generate_question(&mut session).await {
                Ok(question) => next_question = Some(question),
                Err(err) => warn!(
                    "No se pudo generar la siguiente pregunta de la sesión {}: {err}",
                    session.id
                ),
            }
        }

        Ok(AnswerOutcome {
            is_correct,
            score,
            feedback,
            correct_answer: question.answer_key.clone(),
            explanation: question.explanation.clone(),
            difficulty: update.difficulty,
            difficulty_changed: update.difficulty_changed,
            mastery_score: update.score,
            questions_answered: answered,
            questions_remaining: self.questions_per_session.saturating_sub(answered),
            session_over,
            next_question,
        })
    }

    /// Explicación de un concepto al nivel de maestría actual del usuario.
    pub async fn explain(&self, user: &str, subject: &str, topic: &str) -> Result<String> {
        let user = validate_field(user, self.max_subject_chars, "usuario")?;
        let subject = validate_field(subject, self.max_subject_chars, "asignatura")?;
        let topic = validate_field(topic, self.max_topic_chars, "tema")?;

        let difficulty = self
            .store
            .load_mastery(&user, &subject, &topic)
            .map(|r| r.difficulty)
            .unwrap_or(Difficulty::Beginner);
        self.generator.explain(&user, &subject, &topic, difficulty).await
    }

    // ---------------------------------------------------------------------
    // INTERNOS
    // ---------------------------------------------------------------------

    fn key(&self, user: &str, subject: &str, topic: &str) -> SessionKey {
        (
            user.trim().to_string(),
            subject.trim().to_string(),
            topic.trim().to_string(),
        )
    }

    fn slot(&self, key: &SessionKey) -> Result<Arc<SessionSlot>> {
        self.sessions
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| {
                TutorError::State(format!(
                    "no hay sesión activa para {} / {} / {}",
                    key.0, key.1, key.2
                ))
            })
    }

    /// Genera una pregunta para la sesión (con grounding si hay corpus) y
    /// la deja como pendiente.
    async fn generate_question(&self, session: &mut Session) -> Result<Question> {
        let recent: Vec<String> = session
            .attempts
            .iter()
            .rev()
            .take(self.recent_questions)
            .map(|a| a.question_text.clone())
            .collect();

        // Con ámbito de documento se sobremuestrea antes de filtrar, para no
        // quedarse corto de chunks del documento elegido.
        let k = if session.document_scope.is_some() {
            self.retrieval_top_k * 4
        } else {
            self.retrieval_top_k
        };
        let mut hits = self.index.query(&session.topic, &session.subject, k).await?;
        if let Some(scope) = session.document_scope {
            hits.retain(|h| h.document_id == scope);
            hits.truncate(self.retrieval_top_k);
        }

        let question = self
            .generator
            .generate(&QuestionRequest {
                user: &session.user,
                subject: &session.subject,
                topic: &session.topic,
                difficulty: session.difficulty,
                recent_questions: &recent,
                hits: &hits,
            })
            .await?;

        self.store.append_event(SessionEvent::QuestionAsked {
            session_id: session.id,
            question_id: question.id,
            difficulty: question.difficulty,
            timestamp: question.generated_at,
        });

        session.pending_question = Some(question.clone());
        Ok(question)
    }

    /// Expiración por duración, comprobada al entrar en cualquier operación
    /// de pregunta/respuesta.
    fn check_wall_clock(&self, key: &SessionKey, session: &mut Session) -> Result<()> {
        let elapsed = (Utc::now() - session.started_at).num_seconds();
        if elapsed >= self.session_duration.as_secs() as i64 {
            self.expire(key, session);
            return Err(TutorError::State(
                "la sesión ha expirado; arranca una nueva".to_string(),
            ));
        }
        Ok(())
    }

    fn expire(&self, key: &SessionKey, session: &mut Session) {
        session.status = SessionStatus::Expired;
        session.ended_at = Some(Utc::now());
        session.pending_question = None;
        self.store.append_event(SessionEvent::SessionExpired {
            session_id: session.id,
            timestamp: Utc::now(),
        });
        self.store
            .append_session_summary(&session.user, SessionSummary::from_session(session));
        self.sessions.lock().unwrap().remove(key);
    }

    /// Archiva la sesión (completada o abortada), emite el evento y guarda
    /// el resumen. No la quita del mapa: eso decide cada llamador.
    fn archive(&self, session: &mut Session, aborted: bool) {
        session.status = SessionStatus::Completed { aborted };
        session.ended_at = Some(Utc::now());
        session.pending_question = None;
        self.store.append_event(SessionEvent::SessionArchived {
            session_id: session.id,
            aborted,
            timestamp: Utc::now(),
        });
        self.store
            .append_session_summary(&session.user, SessionSummary::from_session(session));
    }

    /// Corrige una respuesta. Tipo test: vale la letra de la opción o el
    /// texto de la opción correcta. Abierta: corrección asistida por LLM
    /// con caída a comparación exacta si el modelo falla.
    async fn grade(&self, user: &str, question: &Question, answer: &str) -> (bool, f64, String) {
        if let Some(options) = &question.options {
            let submitted = normalize(answer);
            let key_match = submitted == normalize(&question.answer_key);
            let text_match = options
                .get(&question.answer_key)
                .map(|text| normalize(text) == submitted)
                .unwrap_or(false);
            let is_correct = key_match || text_match;
            let feedback = if is_correct {
                "¡Correcto!".to_string()
            } else {
                format!("Incorrecto. La respuesta correcta era {}", question.answer_key)
            };
            return (is_correct, if is_correct { 1.0 } else { 0.0 }, feedback);
        }

        match self
            .generator
            .grade_open_answer(user, &question.text, &question.answer_key, answer)
            .await
        {
            Ok(grading) => (grading.is_correct, grading.score, grading.feedback),
            Err(err) => {
                warn!("Corrección LLM no disponible, usando comparación exacta: {err}");
                let is_correct = normalize(answer) == normalize(&question.answer_key);
                let feedback = if is_correct {
                    "¡Correcto!".to_string()
                } else {
                    "Incorrecto. Revisa la explicación.".to_string()
                };
                (is_correct, if is_correct { 1.0 } else { 0.0 }, feedback)
            }
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Valida un campo de texto del usuario: no vacío, dentro del límite de
/// longitud y sin caracteres vetados.
fn validate_field(value: &str, max_chars: usize, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TutorError::InvalidInput(format!(
            "El campo '{field}' no puede estar vacío"
        )));
    }
    if trimmed.chars().count() > max_chars {
        return Err(TutorError::InvalidInput(format!(
            "El campo '{field}' supera los {max_chars} caracteres"
        )));
    }
    if trimmed.chars().any(|c| DANGEROUS_CHARS.contains(&c)) {
        return Err(TutorError::InvalidInput(format!(
            "El campo '{field}' contiene caracteres no permitidos"
        )));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{TextCompletion, TextEmbedder};
    use crate::rate_limiter::RateLimiter;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedLlm {
        responses: Mutex<VecDeque<Result<String>>>,
    }

    #[async_trait]
    impl TextCompletion for ScriptedLlm {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TutorError::Unavailable("guion agotado".into())))
        }
    }

    struct FlatEmbedder;

    #[async_trait]
    impl TextEmbedder for FlatEmbedder {
        async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
    }

    fn mc_question_json() -> Result<String> {
        Ok(r#"{
            "question": "¿Qué comprueba el borrow checker?",
            "options": {"A": "Préstamos", "B": "Macros", "C": "Linker", "D": "Nada"},
            "correct": "A",
            "explanation": "Las reglas de préstamo.",
            "difficulty": "beginner"
        }"#
        .to_string())
    }

    fn open_question_json() -> Result<String> {
        Ok(r#"{"question": "¿Quién libera un Box?", "correct": "el dueño", "explanation": "RAII"}"#
            .to_string())
    }

    struct Harness {
        orchestrator: SessionOrchestrator,
        store: Arc<MemoryStore>,
    }

    fn harness(cfg: AppConfig, responses: Vec<Result<String>>) -> Harness {
        let llm = Arc::new(ScriptedLlm {
            responses: Mutex::new(responses.into()),
        });
        let limiter = Arc::new(RateLimiter::from_config(&cfg));
        let generator = Arc::new(QuestionGenerator::new(&cfg, llm, limiter));
        let index = Arc::new(DocumentIndex::new(&cfg, Arc::new(FlatEmbedder)));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = SessionOrchestrator::new(&cfg, generator, index, store.clone());
        Harness { orchestrator, store }
    }

    #[tokio::test]
    async fn rejects_dangerous_characters_and_overlong_fields() {
        let h = harness(AppConfig::for_tests(), vec![]);
        let err = h
            .orchestrator
            .start_session("ana", "rust<script>", "traits", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::InvalidInput(_)));

        let long_topic = "x".repeat(101);
        let err = h
            .orchestrator
            .start_session("ana", "rust", &long_topic, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn start_generates_the_first_question() {
        let h = harness(AppConfig::for_tests(), vec![mc_question_json()]);
        let session = h
            .orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();

        let pending = session.pending_question.unwrap();
        assert_eq!(pending.text, "¿Qué comprueba el borrow checker?");
        assert_eq!(session.difficulty, Difficulty::Beginner);
    }

    #[tokio::test]
    async fn restart_archives_the_previous_session_and_counts_it() {
        let h = harness(
            AppConfig::for_tests(),
            vec![mc_question_json(), mc_question_json()],
        );
        let first = h
            .orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();
        let second = h
            .orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.restart_count, 1);

        // La sesión anterior quedó archivada como abortada.
        let archived = h
            .store
            .events()
            .into_iter()
            .any(|e| matches!(e, SessionEvent::SessionArchived { aborted: true, .. }));
        assert!(archived);
        assert_eq!(h.store.list_session_summaries("ana").len(), 1);
    }

    #[tokio::test]
    async fn explicit_difficulty_overrides_the_mastery_level() {
        let h = harness(AppConfig::for_tests(), vec![mc_question_json()]);
        let mut record = MasteryRecord::new("ana", "rust", "traits", Difficulty::Beginner);
        record.consecutive_correct = 2;
        h.store.upsert_mastery(record);

        let session = h
            .orchestrator
            .start_session("ana", "rust", "traits", Some(Difficulty::Advanced), None)
            .await
            .unwrap();
        assert_eq!(session.difficulty, Difficulty::Advanced);

        // El registro adopta el nivel pedido y las rachas vuelven a cero.
        let record = h.store.load_mastery("ana", "rust", "traits").unwrap();
        assert_eq!(record.difficulty, Difficulty::Advanced);
        assert_eq!(record.consecutive_correct, 0);
    }

    #[tokio::test]
    async fn submitting_without_a_pending_question_is_a_state_error() {
        // Una sola respuesta guionizada: la generación de la segunda
        // pregunta falla y la sesión queda sin pregunta pendiente.
        let h = harness(AppConfig::for_tests(), vec![mc_question_json()]);
        h.orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .submit_answer("ana", "rust", "traits", "A", 5)
            .await
            .unwrap();
        assert!(outcome.is_correct);
        assert!(outcome.next_question.is_none());
        assert!(!outcome.session_over);

        let err = h
            .orchestrator
            .submit_answer("ana", "rust", "traits", "A", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::State(_)));
    }

    #[tokio::test]
    async fn multiple_choice_accepts_the_letter_or_the_option_text() {
        let responses = vec![
            mc_question_json(),
            mc_question_json(),
            mc_question_json(),
            mc_question_json(),
        ];
        let h = harness(AppConfig::for_tests(), responses);
        h.orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();

        // Por letra, en minúscula.
        let outcome = h
            .orchestrator
            .submit_answer("ana", "rust", "traits", "a", 7)
            .await
            .unwrap();
        assert!(outcome.is_correct);
        assert!(outcome.next_question.is_some());

        // Por el texto de la opción correcta.
        let outcome = h
            .orchestrator
            .submit_answer("ana", "rust", "traits", "préstamos", 7)
            .await
            .unwrap();
        assert!(outcome.is_correct);

        // Respuesta equivocada.
        let outcome = h
            .orchestrator
            .submit_answer("ana", "rust", "traits", "B", 7)
            .await
            .unwrap();
        assert!(!outcome.is_correct);
        assert_eq!(outcome.correct_answer, "A");

        let record = h.store.load_mastery("ana", "rust", "traits").unwrap();
        assert_eq!(record.times_practiced, 3);
    }

    #[tokio::test]
    async fn next_question_redelivers_the_pending_one() {
        let h = harness(AppConfig::for_tests(), vec![mc_question_json()]);
        let session = h
            .orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();
        let pending_id = session.pending_question.unwrap().id;

        let again = h
            .orchestrator
            .next_question("ana", "rust", "traits")
            .await
            .unwrap();
        assert_eq!(again.id, pending_id);
    }

    #[tokio::test]
    async fn three_correct_answers_raise_the_session_difficulty() {
        let responses = vec![
            mc_question_json(),
            mc_question_json(),
            mc_question_json(),
            mc_question_json(),
        ];
        let h = harness(AppConfig::for_tests(), responses);
        h.orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();

        for i in 0..3 {
            let outcome = h
                .orchestrator
                .submit_answer("ana", "rust", "traits", "A", 5)
                .await
                .unwrap();
            if i < 2 {
                assert_eq!(outcome.difficulty, Difficulty::Beginner);
                assert!(!outcome.difficulty_changed);
            } else {
                assert_eq!(outcome.difficulty, Difficulty::Intermediate);
                assert!(outcome.difficulty_changed);
            }
        }

        let snapshot = h
            .orchestrator
            .session_snapshot("ana", "rust", "traits")
            .unwrap();
        assert_eq!(snapshot.difficulty, Difficulty::Intermediate);
        assert_eq!(snapshot.difficulty_changes.len(), 1);
        assert_eq!(snapshot.difficulty_changes[0].from, Difficulty::Beginner);

        // Cada intento queda anotado con la dificultad vigente al responder;
        // el ascenso se aplica después de registrar el tercer acierto.
        assert_eq!(snapshot.attempts.len(), 3);
        assert!(snapshot
            .attempts
            .iter()
            .all(|a| a.difficulty == Difficulty::Beginner));
    }

    #[tokio::test]
    async fn session_expires_when_the_question_quota_is_reached() {
        let mut cfg = AppConfig::for_tests();
        cfg.questions_per_session = 2;
        let h = harness(cfg, vec![mc_question_json(), mc_question_json()]);
        h.orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .submit_answer("ana", "rust", "traits", "A", 5)
            .await
            .unwrap();
        assert!(!outcome.session_over);

        let outcome = h
            .orchestrator
            .submit_answer("ana", "rust", "traits", "A", 5)
            .await
            .unwrap();
        assert!(outcome.session_over);
        assert!(outcome.next_question.is_none());

        // La sesión expiró: ya no admite operaciones.
        let err = h
            .orchestrator
            .next_question("ana", "rust", "traits")
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::State(_)));

        let expired = h
            .store
            .events()
            .into_iter()
            .any(|e| matches!(e, SessionEvent::SessionExpired { .. }));
        assert!(expired);
        assert_eq!(h.store.list_session_summaries("ana").len(), 1);
    }

    #[tokio::test]
    async fn wall_clock_expiry_rejects_further_operations() {
        let mut cfg = AppConfig::for_tests();
        cfg.session_duration = Duration::from_secs(0);
        let h = harness(cfg, vec![mc_question_json()]);
        h.orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();

        let err = h
            .orchestrator
            .submit_answer("ana", "rust", "traits", "A", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, TutorError::State(_)));

        let expired = h
            .store
            .events()
            .into_iter()
            .any(|e| matches!(e, SessionEvent::SessionExpired { .. }));
        assert!(expired);
    }

    #[tokio::test]
    async fn open_answer_falls_back_to_exact_comparison_when_grading_fails() {
        // Guion: pregunta abierta; fallo del LLM al corregir; siguiente
        // pregunta abierta.
        let responses = vec![
            open_question_json(),
            Err(TutorError::Unavailable("timeout".into())),
            open_question_json(),
        ];
        let h = harness(AppConfig::for_tests(), responses);
        let session = h
            .orchestrator
            .start_session("ana", "rust", "ownership", None, None)
            .await
            .unwrap();
        assert!(session.pending_question.unwrap().options.is_none());

        let outcome = h
            .orchestrator
            .submit_answer("ana", "rust", "ownership", "  EL DUEÑO ", 4)
            .await
            .unwrap();
        assert!(outcome.is_correct);
        assert_eq!(outcome.score, 1.0);
    }

    /// LLM cuya primera llamada queda bloqueada hasta que el test suelte un
    /// permiso; las siguientes responden de inmediato.
    struct GatedLlm {
        gate: tokio::sync::Semaphore,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TextCompletion for GatedLlm {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            use std::sync::atomic::Ordering;
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|_| TutorError::Unavailable("semáforo cerrado".into()))?;
                permit.forget();
            }
            mc_question_json()
        }
    }

    #[tokio::test]
    async fn concurrent_starts_on_the_same_key_archive_the_loser() {
        use std::sync::atomic::Ordering;

        let cfg = AppConfig::for_tests();
        let llm = Arc::new(GatedLlm {
            gate: tokio::sync::Semaphore::new(0),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let limiter = Arc::new(RateLimiter::from_config(&cfg));
        let generator = Arc::new(QuestionGenerator::new(&cfg, llm.clone(), limiter));
        let index = Arc::new(DocumentIndex::new(&cfg, Arc::new(FlatEmbedder)));
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(SessionOrchestrator::new(
            &cfg,
            generator,
            index,
            store.clone(),
        ));

        // El primer arranque se queda dentro de la llamada al LLM.
        let first = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                orchestrator
                    .start_session("ana", "rust", "traits", None, None)
                    .await
            }
        });
        while llm.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        // El segundo arranque sobre la misma clave se completa entero
        // mientras el primero sigue generando su pregunta.
        let second = orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();

        llm.gate.add_permits(1);
        let first = first.await.unwrap().unwrap();
        assert_ne!(first.id, second.id);

        // La que se registró en último lugar queda activa; la otra no se
        // pierde: está archivada como abortada con su resumen guardado.
        let active = orchestrator
            .session_snapshot("ana", "rust", "traits")
            .unwrap();
        assert_eq!(active.id, first.id);
        let aborted = store
            .events()
            .into_iter()
            .any(|e| matches!(e, SessionEvent::SessionArchived { aborted: true, .. }));
        assert!(aborted);
        assert_eq!(store.list_session_summaries("ana").len(), 1);
    }

    #[tokio::test]
    async fn ending_a_session_returns_its_summary() {
        let h = harness(
            AppConfig::for_tests(),
            vec![mc_question_json(), mc_question_json()],
        );
        h.orchestrator
            .start_session("ana", "rust", "traits", None, None)
            .await
            .unwrap();
        h.orchestrator
            .submit_answer("ana", "rust", "traits", "B", 3)
            .await
            .unwrap();

        let summary = h.orchestrator.end_session("ana", "rust", "traits").unwrap();
        assert_eq!(summary.questions_answered, 1);
        assert_eq!(summary.questions_correct, 0);
        assert!(h
            .orchestrator
            .session_snapshot("ana", "rust", "traits")
            .is_none());
    }
}

//! Modelos de dominio (sesiones de estudio, preguntas, maestría y corpus documental).

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TutorError;

/// Nivel de dificultad de una sesión o pregunta. Siempre uno de los tres
/// niveles; los cambios automáticos son de un paso como máximo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn from_str(s: &str) -> Result<Self, TutorError> {
        match s.to_lowercase().as_str() {
            "beginner" => Ok(Self::Beginner),
            "intermediate" => Ok(Self::Intermediate),
            "advanced" => Ok(Self::Advanced),
            other => Err(TutorError::InvalidInput(format!(
                "Nivel de dificultad no reconocido: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Advanced => "advanced",
        }
    }

    /// Un nivel hacia arriba, con tope en `Advanced`.
    pub fn step_up(self) -> Self {
        match self {
            Self::Beginner => Self::Intermediate,
            Self::Intermediate | Self::Advanced => Self::Advanced,
        }
    }

    /// Un nivel hacia abajo, con suelo en `Beginner`.
    pub fn step_down(self) -> Self {
        match self {
            Self::Advanced => Self::Intermediate,
            Self::Intermediate | Self::Beginner => Self::Beginner,
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estado del ciclo de vida de una sesión.
///
/// Una sesión reiniciada no se borra: se archiva como
/// `Completed { aborted: true }` para conservar el histórico.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed { aborted: bool },
    Expired,
}

/// Pregunta generada por el LLM. Inmutable una vez creada.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub text: String,
    /// Opciones A..D para preguntas tipo test; `None` para pregunta abierta.
    pub options: Option<BTreeMap<String, String>>,
    /// Letra de la opción correcta (tipo test) o respuesta esperada /
    /// rúbrica (pregunta abierta).
    pub answer_key: String,
    pub explanation: String,
    /// Dificultad en vigor cuando se generó.
    pub difficulty: Difficulty,
    /// Chunks del corpus usados como grounding (vacío si la pregunta no
    /// está anclada en documentos).
    pub grounding_chunk_ids: Vec<Uuid>,
    pub generated_at: DateTime<Utc>,
}

/// Registro de una pregunta respondida. Se crea al corregir y no se
/// modifica nunca: el histórico de una sesión es sólo-añadir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionAttempt {
    pub question_id: Uuid,
    pub question_text: String,
    pub user_answer: String,
    pub is_correct: bool,
    /// Puntuación en [0,1]; permite crédito parcial en la corrección
    /// asistida por LLM.
    pub score: f64,
    pub feedback: Option<String>,
    pub time_taken_secs: i64,
    /// Dificultad en vigor cuando se hizo la pregunta.
    pub difficulty: Difficulty,
    pub answered_at: DateTime<Utc>,
}

/// Cambio de dificultad dentro de una sesión (automático o por reinicio).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DifficultyChange {
    pub from: Difficulty,
    pub to: Difficulty,
    pub at_question: u32,
    pub timestamp: DateTime<Utc>,
}

/// Sesión de estudio en curso o archivada.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user: String,
    pub subject: String,
    pub topic: String,
    pub difficulty: Difficulty,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Histórico estrictamente ordenado en el tiempo, sólo-añadir.
    pub attempts: Vec<QuestionAttempt>,
    /// Pregunta pendiente de respuesta, si la hay.
    pub pending_question: Option<Question>,
    /// Documento sobre el que anclar las preguntas, si se eligió uno.
    pub document_scope: Option<Uuid>,
    /// Reinicios acumulados sobre este (usuario, asignatura, tema).
    pub restart_count: u32,
    pub difficulty_changes: Vec<DifficultyChange>,
}

impl Session {
    pub fn questions_answered(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn questions_correct(&self) -> u32 {
        self.attempts.iter().filter(|a| a.is_correct).count() as u32
    }

    /// Porcentaje de aciertos de la sesión.
    pub fn accuracy(&self) -> f64 {
        if self.attempts.is_empty() {
            return 0.0;
        }
        self.questions_correct() as f64 / self.attempts.len() as f64 * 100.0
    }
}

/// Señal de rendimiento por (usuario, asignatura, tema). Sobrevive a la
/// finalización o reinicio de las sesiones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub user: String,
    pub subject: String,
    pub topic: String,
    /// Puntuación de maestría en [0,1], ponderada hacia lo reciente.
    pub score: f64,
    pub difficulty: Difficulty,
    /// Últimos N veredictos (true = acierto), el más reciente al final.
    pub window: VecDeque<bool>,
    pub consecutive_correct: u32,
    pub consecutive_incorrect: u32,
    pub times_practiced: u32,
    pub last_practiced: DateTime<Utc>,
}

impl MasteryRecord {
    pub fn new(user: &str, subject: &str, topic: &str, difficulty: Difficulty) -> Self {
        Self {
            user: user.to_string(),
            subject: subject.to_string(),
            topic: topic.to_string(),
            score: 0.0,
            difficulty,
            window: VecDeque::new(),
            consecutive_correct: 0,
            consecutive_incorrect: 0,
            times_practiced: 0,
            last_practiced: Utc::now(),
        }
    }
}

/// Resumen de una sesión archivada, tal y como viaja en la exportación de
/// progreso.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub subject: String,
    pub topic: String,
    pub difficulty: Difficulty,
    pub questions_answered: u32,
    pub questions_correct: u32,
    pub accuracy: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionSummary {
    pub fn from_session(session: &Session) -> Self {
        Self {
            subject: session.subject.clone(),
            topic: session.topic.clone(),
            difficulty: session.difficulty,
            questions_answered: session.questions_answered(),
            questions_correct: session.questions_correct(),
            accuracy: session.accuracy(),
            started_at: session.started_at,
            ended_at: session.ended_at,
        }
    }
}

/// Documento ingerido en el índice, delimitado por asignatura.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: Uuid,
    pub subject: String,
    pub title: String,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
}

/// Trozo de texto acotado de un documento, con su embedding. Pertenece a
/// exactamente un documento y se destruye con él.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub subject: String,
    /// Número de orden de ingesta, monotónico en todo el índice. Decide
    /// los empates de similitud (el más reciente primero).
    pub seq: u64,
    pub text: String,
    pub embedding: Vec<f64>,
}

/// Resultado de la ingesta de un documento. La ingesta parcial no es un
/// error: los recortes y chunks saltados se reportan aquí.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestOutcome {
    pub document_id: Option<Uuid>,
    pub chunks_created: usize,
    pub chunks_skipped: usize,
    pub truncated: bool,
}

/// Resumen de la ingesta de un directorio completo.
#[derive(Debug, Default, Serialize)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_ingested: u32,
    pub files_skipped: u32,
    pub chunks_created: usize,
    pub chunks_skipped: usize,
}

/// Implementa cómo se mostrará el resumen como texto.
impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} ingeridos, {} omitidos. {} chunks creados, {} saltados.",
            self.files_scanned,
            self.files_ingested,
            self.files_skipped,
            self.chunks_created,
            self.chunks_skipped
        )
    }
}

/// Evento emitido por el orquestador en cada transición, consumido por el
/// colaborador de persistencia a través de `ProgressStore`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session_id: Uuid,
        user: String,
        subject: String,
        topic: String,
        difficulty: Difficulty,
        timestamp: DateTime<Utc>,
    },
    QuestionAsked {
        session_id: Uuid,
        question_id: Uuid,
        difficulty: Difficulty,
        timestamp: DateTime<Utc>,
    },
    AnswerGraded {
        session_id: Uuid,
        question_id: Uuid,
        is_correct: bool,
        score: f64,
        timestamp: DateTime<Utc>,
    },
    DifficultyChanged {
        session_id: Uuid,
        from: Difficulty,
        to: Difficulty,
        timestamp: DateTime<Utc>,
    },
    SessionArchived {
        session_id: Uuid,
        aborted: bool,
        timestamp: DateTime<Utc>,
    },
    SessionExpired {
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    MasteryUpdated {
        user: String,
        subject: String,
        topic: String,
        score: f64,
        difficulty: Difficulty,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difficulty_steps_clamp_at_the_ends() {
        assert_eq!(Difficulty::Advanced.step_up(), Difficulty::Advanced);
        assert_eq!(Difficulty::Beginner.step_down(), Difficulty::Beginner);
        assert_eq!(Difficulty::Beginner.step_up(), Difficulty::Intermediate);
        assert_eq!(Difficulty::Advanced.step_down(), Difficulty::Intermediate);
    }

    #[test]
    fn difficulty_serializes_lowercase() {
        let json = serde_json::to_string(&Difficulty::Intermediate).unwrap();
        assert_eq!(json, "\"intermediate\"");
        assert_eq!(Difficulty::from_str("Advanced").unwrap(), Difficulty::Advanced);
        assert!(Difficulty::from_str("imposible").is_err());
    }
}

//! Generación de preguntas vía LLM: construcción del prompt, validación de
//! la respuesta estructurada y reintentos correctivos acotados.
//!
//! Toda llamada al modelo pasa antes por el limitador; una denegación se
//! propaga sin llegar a invocar al LLM. El prompt nunca supera el máximo
//! configurado: el contexto de grounding se recorta (peor similitud primero)
//! para caber en el presupuesto restante, y si la parte fija ya no cabe se
//! falla con `PromptTooLarge`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{Result, TutorError};
use crate::index::ScoredChunk;
use crate::llm::{strip_json_fences, TextCompletion};
use crate::models::{Difficulty, Question};
use crate::rate_limiter::RateLimiter;
use crate::retrieval::assemble_context;

const SYSTEM_QUESTION: &str = "Eres un tutor experto creando preguntas de práctica. \
Devuelve únicamente JSON válido, sin formato markdown.";

const SYSTEM_GRADING: &str = "Eres un tutor que evalúa respuestas de estudiantes. \
Sé justo y constructivo. Devuelve únicamente JSON válido, sin formato markdown.";

const SYSTEM_EXPLAIN: &str = "Eres un tutor paciente que explica conceptos con \
claridad y ejemplos.";

/// Margen reservado en el presupuesto del prompt para el apéndice del
/// reintento correctivo, de modo que el reintento nunca reviente el límite.
const CORRECTIVE_MARGIN: usize = 300;

/// Petición de generación de una pregunta.
pub struct QuestionRequest<'a> {
    pub user: &'a str,
    pub subject: &'a str,
    pub topic: &'a str,
    pub difficulty: Difficulty,
    /// Enunciados recientes que el modelo no debe repetir.
    pub recent_questions: &'a [String],
    /// Chunks de grounding en orden de similitud descendente (vacío si la
    /// generación no está anclada en documentos).
    pub hits: &'a [ScoredChunk],
}

/// Veredicto de la corrección asistida por LLM de una respuesta abierta.
#[derive(Debug, Clone)]
pub struct Grading {
    pub is_correct: bool,
    pub feedback: String,
    pub score: f64,
}

pub struct QuestionGenerator {
    llm: Arc<dyn TextCompletion>,
    limiter: Arc<RateLimiter>,
    max_prompt_chars: usize,
    max_retries: u32,
}

impl QuestionGenerator {
    pub fn new(cfg: &AppConfig, llm: Arc<dyn TextCompletion>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            llm,
            limiter,
            max_prompt_chars: cfg.max_prompt_chars,
            max_retries: cfg.max_generation_retries,
        }
    }

    // ---------------------------------------------------------------------
    // GENERACIÓN DE PREGUNTAS
    // ---------------------------------------------------------------------

    /// Genera una pregunta bien formada, reintentando con un prompt
    /// correctivo ante salida malformada hasta agotar el presupuesto de
    /// reintentos.
    pub async fn generate(&self, req: &QuestionRequest<'_>) -> Result<Question> {
        let base = self.base_prompt(req);
        if base.len() > self.max_prompt_chars.saturating_sub(CORRECTIVE_MARGIN) {
            return Err(TutorError::PromptTooLarge {
                len: base.len(),
                max: self.max_prompt_chars,
            });
        }

        // El contexto se recorta al presupuesto que deja la parte fija.
        let context_header = "\n\nBásate en este contexto del material de estudio:\n";
        let budget = self
            .max_prompt_chars
            .saturating_sub(CORRECTIVE_MARGIN)
            .saturating_sub(base.len())
            .saturating_sub(context_header.len());
        let grounding = assemble_context(req.hits, budget);

        let prompt = if grounding.is_empty() {
            base
        } else {
            format!("{base}{context_header}{}", grounding.text)
        };

        let mut last_err =
            TutorError::Generation("sin intentos de generación".to_string());
        for attempt in 0..=self.max_retries {
            let attempt_prompt = if attempt == 0 {
                prompt.clone()
            } else {
                // Reintento correctivo: incluye el motivo del rechazo.
                format!(
                    "{prompt}\n\nTu respuesta anterior no era válida ({last_err}). \
                     Devuelve únicamente el objeto JSON pedido, sin texto adicional."
                )
            };

            // La denegación de cuota corta en seco, sin llamar al modelo.
            self.limiter.acquire(req.user, attempt_prompt.len())?;

            match self.llm.complete(SYSTEM_QUESTION, &attempt_prompt).await {
                Ok(response) => {
                    match parse_question(&response, req.difficulty, &grounding.chunk_ids) {
                        Ok(question) => return Ok(question),
                        Err(err) => {
                            warn!(
                                "Respuesta del LLM malformada (intento {}): {err}",
                                attempt + 1
                            );
                            last_err = err;
                        }
                    }
                }
                Err(err @ TutorError::Unavailable(_)) => {
                    warn!("LLM no disponible (intento {}): {err}", attempt + 1);
                    last_err = err;
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_err)
    }

    fn base_prompt(&self, req: &QuestionRequest<'_>) -> String {
        let mut prompt = format!(
            "Genera una pregunta de práctica de nivel {} sobre {} en la asignatura {}.",
            req.difficulty, req.topic, req.subject
        );

        if !req.recent_questions.is_empty() {
            prompt.push_str("\n\nNo repitas ninguna de estas preguntas recientes:");
            for q in req.recent_questions {
                prompt.push_str("\n- ");
                prompt.push_str(q);
            }
        }

        prompt.push_str(&format!(
            "\n\nDevuelve ÚNICAMENTE un objeto JSON con esta estructura exacta \
             (sin markdown ni texto extra):\n\
             {{\n  \"question\": \"El enunciado de la pregunta\",\n  \
             \"options\": {{\"A\": \"opción 1\", \"B\": \"opción 2\", \"C\": \"opción 3\", \"D\": \"opción 4\"}},\n  \
             \"correct\": \"A\",\n  \
             \"explanation\": \"Por qué esa respuesta es correcta\",\n  \
             \"difficulty\": \"{}\"\n}}",
            req.difficulty
        ));
        prompt
    }

    // ---------------------------------------------------------------------
    // CORRECCIÓN Y EXPLICACIONES
    // ---------------------------------------------------------------------

    /// Corrección asistida por LLM de una respuesta abierta. Una sola
    /// llamada: si falla, el orquestador cae a la comparación exacta.
    pub async fn grade_open_answer(
        &self,
        user: &str,
        question_text: &str,
        expected: &str,
        user_answer: &str,
    ) -> Result<Grading> {
        let prompt = format!(
            "Pregunta: {question_text}\n\
             Respuesta del estudiante: {user_answer}\n\
             Respuesta correcta: {expected}\n\n\
             ¿Es correcta la respuesta del estudiante? Considera el crédito \
             parcial para respuestas casi correctas.\n\
             Devuelve ÚNICAMENTE un objeto JSON:\n\
             {{\n  \"is_correct\": true o false,\n  \
             \"feedback\": \"Comentario breve y constructivo\",\n  \
             \"score\": 0.0 a 1.0\n}}"
        );

        self.limiter.acquire(user, prompt.len())?;
        let response = self.llm.complete(SYSTEM_GRADING, &prompt).await?;
        parse_grading(&response)
    }

    /// Explicación de un concepto al nivel pedido.
    pub async fn explain(
        &self,
        user: &str,
        subject: &str,
        topic: &str,
        difficulty: Difficulty,
    ) -> Result<String> {
        let prompt = format!(
            "Explica {topic} en la asignatura {subject} a nivel {difficulty}. \
             Usa lenguaje claro y ejemplos."
        );
        self.limiter.acquire(user, prompt.len())?;
        self.llm.complete(SYSTEM_EXPLAIN, &prompt).await
    }
}

// --- Parseo y validación del JSON del modelo ---

#[derive(Debug, Deserialize)]
struct RawQuestion {
    question: String,
    #[serde(default)]
    options: Option<BTreeMap<String, String>>,
    correct: String,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    difficulty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawGrading {
    is_correct: bool,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    score: Option<f64>,
}

/// Valida la respuesta del modelo contra el esquema esperado y construye la
/// `Question` inmutable. Nunca se confía en salida sin validar.
fn parse_question(
    response: &str,
    requested: Difficulty,
    grounding_chunk_ids: &[Uuid],
) -> Result<Question> {
    let cleaned = strip_json_fences(response);
    let raw: RawQuestion = serde_json::from_str(cleaned)
        .map_err(|e| TutorError::Generation(format!("JSON inválido: {e}")))?;

    if raw.question.trim().is_empty() {
        return Err(TutorError::Generation(
            "El enunciado de la pregunta está vacío".to_string(),
        ));
    }

    let correct = raw.correct.trim().to_uppercase();
    let options = match raw.options {
        Some(opts) if !opts.is_empty() => {
            if !opts.contains_key(&correct) {
                return Err(TutorError::Generation(format!(
                    "La clave correcta '{correct}' no está entre las opciones"
                )));
            }
            Some(opts)
        }
        // Sin opciones: pregunta abierta, `correct` es la respuesta esperada.
        _ => None,
    };

    // Eco de dificultad: un valor irreconocible es violación de esquema; una
    // discrepancia con lo pedido se anota pero manda la dificultad solicitada.
    if let Some(echo) = &raw.difficulty {
        let echoed = Difficulty::from_str(echo).map_err(|_| {
            TutorError::Generation(format!("Eco de dificultad irreconocible: '{echo}'"))
        })?;
        if echoed != requested {
            warn!("El modelo eligió dificultad {echoed} en vez de {requested}");
        }
    }

    let answer_key = if options.is_some() {
        correct
    } else {
        raw.correct.trim().to_string()
    };

    Ok(Question {
        id: Uuid::new_v4(),
        text: raw.question.trim().to_string(),
        options,
        answer_key,
        explanation: raw.explanation.trim().to_string(),
        difficulty: requested,
        grounding_chunk_ids: grounding_chunk_ids.to_vec(),
        generated_at: Utc::now(),
    })
}

fn parse_grading(response: &str) -> Result<Grading> {
    let cleaned = strip_json_fences(response);
    let raw: RawGrading = serde_json::from_str(cleaned)
        .map_err(|e| TutorError::Generation(format!("JSON de corrección inválido: {e}")))?;

    let score = raw
        .score
        .unwrap_or(if raw.is_correct { 1.0 } else { 0.0 })
        .clamp(0.0, 1.0);

    Ok(Grading {
        is_correct: raw.is_correct,
        feedback: raw.feedback.trim().to_string(),
        score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// LLM falso con respuestas guionizadas; registra los prompts recibidos.
    struct MockLlm {
        responses: Mutex<VecDeque<Result<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl MockLlm {
        fn scripted(responses: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }

        fn prompt(&self, i: usize) -> String {
            self.prompts.lock().unwrap()[i].clone()
        }
    }

    #[async_trait]
    impl TextCompletion for MockLlm {
        async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TutorError::Unavailable("guion agotado".into())))
        }
    }

    fn valid_question_json() -> String {
        r#"{
            "question": "¿Qué hace el borrow checker?",
            "options": {"A": "Verifica préstamos", "B": "Compila", "C": "Enlaza", "D": "Nada"},
            "correct": "a",
            "explanation": "Comprueba las reglas de préstamo.",
            "difficulty": "beginner"
        }"#
        .to_string()
    }

    fn generator_with(llm: Arc<MockLlm>, cfg: &AppConfig) -> QuestionGenerator {
        let limiter = Arc::new(RateLimiter::from_config(cfg));
        QuestionGenerator::new(cfg, llm, limiter)
    }

    fn request<'a>(recent: &'a [String], hits: &'a [ScoredChunk]) -> QuestionRequest<'a> {
        QuestionRequest {
            user: "local",
            subject: "rust",
            topic: "ownership",
            difficulty: Difficulty::Beginner,
            recent_questions: recent,
            hits,
        }
    }

    #[tokio::test]
    async fn parses_a_valid_response_and_normalizes_the_key() {
        let llm = MockLlm::scripted(vec![Ok(valid_question_json())]);
        let gen = generator_with(llm.clone(), &AppConfig::for_tests());

        let q = gen.generate(&request(&[], &[])).await.unwrap();
        assert_eq!(q.answer_key, "A");
        assert_eq!(q.difficulty, Difficulty::Beginner);
        assert!(q.options.unwrap().contains_key("A"));
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_output_triggers_a_corrective_retry() {
        let llm = MockLlm::scripted(vec![
            Ok("esto no es JSON".to_string()),
            Ok(valid_question_json()),
        ]);
        let gen = generator_with(llm.clone(), &AppConfig::for_tests());

        let q = gen.generate(&request(&[], &[])).await.unwrap();
        assert_eq!(q.text, "¿Qué hace el borrow checker?");
        assert_eq!(llm.calls(), 2);
        assert!(llm.prompt(1).contains("no era válida"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_generation_error() {
        let llm = MockLlm::scripted(vec![
            Ok("basura".to_string()),
            Ok("más basura".to_string()),
            Ok("todavía basura".to_string()),
        ]);
        let gen = generator_with(llm.clone(), &AppConfig::for_tests());

        let err = gen.generate(&request(&[], &[])).await.unwrap_err();
        assert!(matches!(err, TutorError::Generation(_)));
        // Intento inicial + 2 reintentos.
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn unreachable_llm_surfaces_unavailable_after_retries() {
        let llm = MockLlm::scripted(vec![
            Err(TutorError::Unavailable("timeout".into())),
            Err(TutorError::Unavailable("timeout".into())),
            Err(TutorError::Unavailable("timeout".into())),
        ]);
        let gen = generator_with(llm.clone(), &AppConfig::for_tests());

        let err = gen.generate(&request(&[], &[])).await.unwrap_err();
        assert!(matches!(err, TutorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn rate_limit_denial_never_reaches_the_model() {
        let llm = MockLlm::scripted(vec![Ok(valid_question_json())]);
        let mut cfg = AppConfig::for_tests();
        cfg.rate_max_calls = 0;
        let gen = generator_with(llm.clone(), &cfg);

        let err = gen.generate(&request(&[], &[])).await.unwrap_err();
        assert!(matches!(err, TutorError::RateLimitExceeded { .. }));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn grounding_context_is_trimmed_to_the_prompt_budget() {
        let llm = MockLlm::scripted(vec![Ok(valid_question_json())]);
        let mut cfg = AppConfig::for_tests();
        cfg.max_prompt_chars = 1600;
        let gen = generator_with(llm.clone(), &cfg);

        let hits = vec![
            ScoredChunk {
                chunk_id: Uuid::new_v4(),
                document_id: Uuid::new_v4(),
                score: 0.9,
                seq: 0,
                text: "x".repeat(400),
            },
            ScoredChunk {
                chunk_id: Uuid::new_v4(),
                document_id: Uuid::new_v4(),
                score: 0.5,
                seq: 1,
                text: "y".repeat(800),
            },
        ];

        let q = gen.generate(&request(&[], &hits)).await.unwrap();
        let sent = llm.prompt(0);
        assert!(sent.len() <= 1600);
        // Sólo cupo el chunk de mayor similitud.
        assert!(sent.contains(&"x".repeat(400)));
        assert!(!sent.contains(&"y".repeat(800)));
        assert_eq!(q.grounding_chunk_ids.len(), 1);
    }

    #[tokio::test]
    async fn oversized_base_prompt_fails_before_calling_anything() {
        let llm = MockLlm::scripted(vec![Ok(valid_question_json())]);
        let mut cfg = AppConfig::for_tests();
        cfg.max_prompt_chars = 200;
        let gen = generator_with(llm.clone(), &cfg);

        let err = gen.generate(&request(&[], &[])).await.unwrap_err();
        assert!(matches!(err, TutorError::PromptTooLarge { .. }));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn recent_questions_are_listed_in_the_prompt() {
        let llm = MockLlm::scripted(vec![Ok(valid_question_json())]);
        let gen = generator_with(llm.clone(), &AppConfig::for_tests());

        let recent = vec!["¿Qué es un lifetime?".to_string()];
        gen.generate(&request(&recent, &[])).await.unwrap();
        assert!(llm.prompt(0).contains("¿Qué es un lifetime?"));
    }

    #[tokio::test]
    async fn open_question_without_options_keeps_expected_answer() {
        let json = r#"{"question": "Explica el ownership", "correct": "El dueño libera el valor", "explanation": ""}"#;
        let llm = MockLlm::scripted(vec![Ok(json.to_string())]);
        let gen = generator_with(llm.clone(), &AppConfig::for_tests());

        let q = gen.generate(&request(&[], &[])).await.unwrap();
        assert!(q.options.is_none());
        assert_eq!(q.answer_key, "El dueño libera el valor");
    }

    #[tokio::test]
    async fn wrong_answer_key_is_a_schema_violation() {
        let json = r#"{
            "question": "¿2+2?",
            "options": {"A": "3", "B": "4"},
            "correct": "Z",
            "explanation": ""
        }"#;
        let llm = MockLlm::scripted(vec![
            Ok(json.to_string()),
            Ok(json.to_string()),
            Ok(json.to_string()),
        ]);
        let gen = generator_with(llm.clone(), &AppConfig::for_tests());

        let err = gen.generate(&request(&[], &[])).await.unwrap_err();
        assert!(matches!(err, TutorError::Generation(_)));
    }

    #[test]
    fn grading_score_defaults_and_clamps() {
        let g = parse_grading(r#"{"is_correct": true, "feedback": "bien"}"#).unwrap();
        assert_eq!(g.score, 1.0);

        let g = parse_grading(r#"{"is_correct": false, "score": -3.0}"#).unwrap();
        assert_eq!(g.score, 0.0);

        let g = parse_grading(r#"{"is_correct": true, "score": 7.5}"#).unwrap();
        assert_eq!(g.score, 1.0);
    }
}

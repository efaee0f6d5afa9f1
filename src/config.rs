//! Carga y gestión de configuración de la aplicación (LLM + límites del motor).
//!
//! Todos los límites numéricos del motor (cuota del limitador, tamaños de
//! prompt y de chunk, ventana de maestría...) son configurables por variable
//! de entorno, con los valores por defecto documentados en cada campo.

use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub frontend_dir: String,

    pub llm_chat_model: String,
    pub llm_embedding_model: String,
    /// Timeout de cada llamada al LLM o al modelo de embeddings.
    pub llm_timeout: Duration,

    // --- Limitador de llamadas ---
    /// Ventana deslizante del limitador (por defecto 60 s).
    pub rate_window: Duration,
    /// Llamadas permitidas por usuario dentro de la ventana (30).
    pub rate_max_calls: u32,
    /// Longitud máxima de un prompt en caracteres (5000).
    pub max_prompt_chars: usize,

    // --- Ingesta de documentos ---
    /// Longitud máxima de un chunk en caracteres (1200).
    pub max_chunk_chars: usize,
    /// Chunks máximos por documento; el exceso se descarta con aviso (1000).
    pub max_chunks_per_document: usize,
    /// Bytes máximos de texto extraído por documento (10 MiB).
    pub max_text_bytes: usize,
    /// Chunks recuperados por consulta de grounding (3).
    pub retrieval_top_k: usize,

    // --- Validación de entrada ---
    pub max_subject_chars: usize,
    pub max_topic_chars: usize,

    // --- Sesiones ---
    /// Duración máxima de una sesión de estudio (30 min).
    pub session_duration: Duration,
    /// Preguntas máximas por sesión (15).
    pub questions_per_session: u32,

    // --- Política de maestría ---
    /// Tamaño de la ventana de intentos recientes (5).
    pub mastery_window: usize,
    /// Factor de decaimiento del peso de cada intento (0.7).
    pub mastery_decay: f64,
    /// Aciertos consecutivos para subir de nivel (3).
    pub threshold_up: u32,
    /// Fallos consecutivos para bajar de nivel (2).
    pub threshold_down: u32,

    // --- Generación de preguntas ---
    /// Reintentos correctivos ante salida malformada del LLM (2).
    pub max_generation_retries: u32,
    /// Preguntas recientes incluidas en el prompt para evitar repeticiones (5).
    pub recent_questions: usize,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        // La clave de OpenAI la consume Rig directamente; aquí sólo
        // comprobamos que esté presente para fallar pronto y con claridad.
        env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("Falta OPENAI_API_KEY en el entorno"))?;

        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());
        let frontend_dir =
            env::var("FRONTEND_DIR").unwrap_or_else(|_| "frontend".to_string());

        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());

        Ok(Self {
            server_addr,
            frontend_dir,
            llm_chat_model,
            llm_embedding_model,
            llm_timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 60u64)?),
            rate_window: Duration::from_secs(env_parse("RATE_WINDOW_SECS", 60u64)?),
            rate_max_calls: env_parse("RATE_MAX_CALLS", 30)?,
            max_prompt_chars: env_parse("MAX_PROMPT_CHARS", 5000)?,
            max_chunk_chars: env_parse("MAX_CHUNK_CHARS", 1200)?,
            max_chunks_per_document: env_parse("MAX_CHUNKS_PER_DOCUMENT", 1000)?,
            max_text_bytes: env_parse("MAX_TEXT_BYTES", 10 * 1024 * 1024)?,
            retrieval_top_k: env_parse("RETRIEVAL_TOP_K", 3)?,
            max_subject_chars: env_parse("MAX_SUBJECT_CHARS", 100)?,
            max_topic_chars: env_parse("MAX_TOPIC_CHARS", 100)?,
            session_duration: Duration::from_secs(
                env_parse("SESSION_DURATION_MINUTES", 30u64)? * 60,
            ),
            questions_per_session: env_parse("QUESTIONS_PER_SESSION", 15)?,
            mastery_window: env_parse("MASTERY_WINDOW", 5)?,
            mastery_decay: env_parse("MASTERY_DECAY", 0.7)?,
            threshold_up: env_parse("THRESHOLD_UP", 3)?,
            threshold_down: env_parse("THRESHOLD_DOWN", 2)?,
            max_generation_retries: env_parse("MAX_GENERATION_RETRIES", 2)?,
            recent_questions: env_parse("RECENT_QUESTIONS", 5)?,
        })
    }
}

/// Lee una variable de entorno numérica con valor por defecto.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Valor inválido para {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl AppConfig {
    /// Configuración autocontenida para los tests, sin tocar el entorno.
    pub fn for_tests() -> Self {
        Self {
            server_addr: "127.0.0.1:0".to_string(),
            frontend_dir: "frontend".to_string(),
            llm_chat_model: "gpt-4o-mini".to_string(),
            llm_embedding_model: "text-embedding-3-small".to_string(),
            llm_timeout: Duration::from_secs(5),
            rate_window: Duration::from_secs(60),
            rate_max_calls: 30,
            max_prompt_chars: 5000,
            max_chunk_chars: 1200,
            max_chunks_per_document: 1000,
            max_text_bytes: 10 * 1024 * 1024,
            retrieval_top_k: 3,
            max_subject_chars: 100,
            max_topic_chars: 100,
            session_duration: Duration::from_secs(30 * 60),
            questions_per_session: 15,
            mastery_window: 5,
            mastery_decay: 0.7,
            threshold_up: 3,
            threshold_down: 2,
            max_generation_retries: 2,
            recent_questions: 5,
        }
    }
}

//! Abstracción sobre Rig para hablar con el LLM y el modelo de embeddings.
//!
//! Los traits `TextCompletion` y `TextEmbedder` son la costura del motor:
//! el generador de preguntas y el índice documental sólo dependen de ellos,
//! lo que permite inyectar modelos falsos en los tests. `LlmManager` es la
//! implementación real sobre el proveedor OpenAI de Rig; otros proveedores
//! se añadirían como ramas adicionales.

use std::time::Duration;

use async_trait::async_trait;
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel as _;
use tokio::time::timeout;

use crate::config::AppConfig;
use crate::error::{Result, TutorError};

/// Servicio de completado de texto (consumido como caja negra).
#[async_trait]
pub trait TextCompletion: Send + Sync {
    /// Envía un prompt y devuelve el texto de la respuesta.
    /// Falla con `Unavailable` si el servicio no responde o agota el timeout.
    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String>;
}

/// Servicio de embeddings de dimensión fija.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Calcula el embedding de cada texto, en el mismo orden.
    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>>;
}

/// Gestor de LLM y embeddings sobre Rig/OpenAI.
#[derive(Debug, Clone)]
pub struct LlmManager {
    pub chat_model: String,
    pub embedding_model: String,
    call_timeout: Duration,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            chat_model: cfg.llm_chat_model.clone(),
            embedding_model: cfg.llm_embedding_model.clone(),
            call_timeout: cfg.llm_timeout,
        })
    }
}

#[async_trait]
impl TextCompletion for LlmManager {
    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String> {
        use rig::client::CompletionClient as _;
        use rig::providers::openai;

        let client = openai::Client::from_env();

        // Modelo de chat por defecto si no se ha configurado otro
        let model_name = if self.chat_model.is_empty() {
            "gpt-4o-mini"
        } else {
            self.chat_model.as_str()
        };

        let agent = client
            .agent(model_name)
            .preamble(system_prompt)
            .build();

        let answer = timeout(self.call_timeout, agent.prompt(prompt))
            .await
            .map_err(|_| {
                TutorError::Unavailable(format!(
                    "El LLM no respondió en {} segundos",
                    self.call_timeout.as_secs()
                ))
            })?
            .map_err(|e| TutorError::Unavailable(e.to_string()))?;

        Ok(answer)
    }
}

#[async_trait]
impl TextEmbedder for LlmManager {
    async fn embed_texts(&self, texts: Vec<String>) -> Result<Vec<Vec<f64>>> {
        use rig::client::EmbeddingsClient as _;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        let client = openai::Client::from_env();

        // Modelo de embeddings: config o default
        let model_name = if self.embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.embedding_model.as_str()
        };

        let embedding_model = client.embedding_model(model_name);
        let expected = texts.len();

        let embeddings = timeout(self.call_timeout, embedding_model.embed_texts(texts))
            .await
            .map_err(|_| {
                TutorError::Embedding(format!(
                    "El modelo de embeddings no respondió en {} segundos",
                    self.call_timeout.as_secs()
                ))
            })?
            .map_err(|e| TutorError::Embedding(e.to_string()))?;

        if embeddings.len() != expected {
            return Err(TutorError::Embedding(format!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                expected
            )));
        }

        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }
}

/// Limpia la respuesta del LLM para quedarnos sólo con el JSON: los modelos
/// tienden a envolverlo en un bloque markdown aunque se les pida lo contrario.
pub fn strip_json_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

//! Errores de dominio del tutor adaptativo.
//!
//! Cada variante corresponde a una condición de fallo bien definida del
//! motor de sesiones; la capa HTTP traduce cada una a un código de estado
//! mediante `status_code()`. El detalle completo se registra en el log del
//! servidor y al usuario sólo le llega el mensaje de la variante.

use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TutorError {
    /// Texto de usuario (asignatura, tema, respuesta) fuera de límites o
    /// con caracteres no permitidos.
    #[error("Entrada inválida: {0}")]
    InvalidInput(String),

    /// Operación no válida para el estado actual de la sesión, o una
    /// segunda operación concurrente sobre la misma sesión.
    #[error("Operación inválida para el estado de la sesión: {0}")]
    State(String),

    /// Cuota de llamadas al LLM agotada. Recuperable: el cliente debe
    /// esperar y reintentar.
    #[error("Límite de llamadas al LLM alcanzado; reintenta en {retry_after_secs} segundos")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// El LLM no devolvió una respuesta parseable tras agotar los
    /// reintentos correctivos.
    #[error("No se pudo generar una salida válida del LLM: {0}")]
    Generation(String),

    /// El prompt supera el tamaño máximo incluso tras recortar el contexto.
    #[error("El prompt excede el tamaño máximo permitido ({len} > {max} caracteres)")]
    PromptTooLarge { len: usize, max: usize },

    /// El servicio LLM no responde (red caída o timeout).
    #[error("Servicio LLM no disponible: {0}")]
    Unavailable(String),

    /// Fallo extrayendo texto de un documento; la ingesta de ese documento
    /// se aborta entera, sin chunks parciales.
    #[error("Error extrayendo texto del documento: {0}")]
    Extraction(String),

    /// Tipo de fichero que el extractor no sabe procesar.
    #[error("Formato de fichero no soportado: {0}")]
    UnsupportedFormat(String),

    /// Fallo calculando un embedding (de la query; los fallos por chunk se
    /// absorben durante la ingesta).
    #[error("Error calculando embeddings: {0}")]
    Embedding(String),

    /// Fichero de exportación de progreso malformado o inconsistente. La
    /// importación es atómica: nada se aplica.
    #[error("Fichero de importación inválido: {0}")]
    ImportValidation(String),
}

impl TutorError {
    /// Código HTTP con el que la API expone cada clase de error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TutorError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            TutorError::State(_) => StatusCode::CONFLICT,
            TutorError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            TutorError::Generation(_) => StatusCode::BAD_GATEWAY,
            TutorError::PromptTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TutorError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TutorError::Extraction(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TutorError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            TutorError::Embedding(_) => StatusCode::BAD_GATEWAY,
            TutorError::ImportValidation(_) => StatusCode::BAD_REQUEST,
        }
    }
}

pub type Result<T> = std::result::Result<T, TutorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_maps_to_429() {
        let err = TutorError::RateLimitExceeded { retry_after_secs: 12 };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert!(err.to_string().contains("12"));
    }
}

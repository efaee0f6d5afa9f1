//! Extracción de texto de ficheros (colaborador externo de la ingesta).
//!
//! Un fallo de extracción tumba la ingesta del documento entero: nunca se
//! crean chunks parciales de un fichero que no se pudo leer bien.

use crate::error::{Result, TutorError};

/// Interfaz de extracción consumida por el índice documental.
pub trait TextExtractor: Send + Sync {
    /// Extrae el texto plano de los bytes de un fichero, dado su tipo
    /// declarado (extensión en minúsculas, sin punto).
    fn extract(&self, file_bytes: &[u8], declared_type: &str) -> Result<String>;
}

/// Extractor por defecto: PDF (vía pdf-extract) y ficheros de texto plano.
pub struct FileExtractor;

impl TextExtractor for FileExtractor {
    fn extract(&self, file_bytes: &[u8], declared_type: &str) -> Result<String> {
        match declared_type {
            "pdf" => {
                // Firma mágica: evita procesar un fichero renombrado a .pdf.
                if !file_bytes.starts_with(b"%PDF") {
                    return Err(TutorError::Extraction(
                        "El contenido no tiene cabecera PDF válida".to_string(),
                    ));
                }
                pdf_extract::extract_text_from_mem(file_bytes)
                    .map_err(|e| TutorError::Extraction(format!("Fallo leyendo el PDF: {e}")))
            }
            "txt" | "md" | "rs" | "toml" | "log" | "html" | "css" | "js" => {
                read_utf8(file_bytes)
            }
            other => {
                // Cualquier otro tipo con MIME text/* también se acepta como
                // texto plano (csv, xml declarado como texto, etc.).
                let is_text = mime_guess::from_ext(other)
                    .first()
                    .map(|m| m.type_() == mime_guess::mime::TEXT)
                    .unwrap_or(false);
                if is_text {
                    read_utf8(file_bytes)
                } else {
                    Err(TutorError::UnsupportedFormat(format!(".{other}")))
                }
            }
        }
    }
}

fn read_utf8(file_bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(file_bytes)
        .map(|s| s.to_string())
        .map_err(|_| TutorError::Extraction("El fichero de texto no es UTF-8 válido".to_string()))
}

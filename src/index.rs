//! Índice documental: troceado, embeddings y búsqueda por similitud.
//!
//! La ingesta trocea el texto extraído respetando dos invariantes (longitud
//! máxima por chunk y número máximo de chunks por documento; el exceso se
//! recorta con aviso, nunca como error) y calcula un embedding por chunk.
//! Un fallo de embedding en un chunk concreto lo excluye de la búsqueda sin
//! abortar la ingesta: el resultado reporta el recuento parcial.
//!
//! La búsqueda `query(texto, asignatura, k)` devuelve los k chunks más
//! parecidos por similitud coseno, restringidos a la asignatura; los empates
//! se deciden a favor del chunk ingerido más recientemente. Un corpus vacío
//! devuelve lista vacía, nunca un error.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::app_state::Status;
use crate::config::AppConfig;
use crate::error::{Result, TutorError};
use crate::extract::TextExtractor;
use crate::llm::TextEmbedder;
use crate::models::{Chunk, Document, IngestOutcome, IngestionSummary};

/// Chunk devuelto por una búsqueda, con su puntuación de similitud.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub score: f64,
    pub seq: u64,
    pub text: String,
}

struct IndexInner {
    documents: HashMap<Uuid, Document>,
    chunks: Vec<Chunk>,
    /// Dimensión fijada por el primer embedding aceptado; los vectores de
    /// otra dimensión se rechazan (el chunk se salta).
    dimension: Option<usize>,
    next_seq: u64,
}

pub struct DocumentIndex {
    embedder: Arc<dyn TextEmbedder>,
    max_chunk_chars: usize,
    max_chunks_per_document: usize,
    max_text_bytes: usize,
    // Las mutaciones (ingesta, borrado) se serializan; las consultas de
    // similitud pueden leer en paralelo.
    inner: RwLock<IndexInner>,
}

impl DocumentIndex {
    pub fn new(cfg: &AppConfig, embedder: Arc<dyn TextEmbedder>) -> Self {
        Self {
            embedder,
            max_chunk_chars: cfg.max_chunk_chars,
            max_chunks_per_document: cfg.max_chunks_per_document,
            max_text_bytes: cfg.max_text_bytes,
            inner: RwLock::new(IndexInner {
                documents: HashMap::new(),
                chunks: Vec::new(),
                dimension: None,
                next_seq: 0,
            }),
        }
    }

    // ---------------------------------------------------------------------
    // INGESTA
    // ---------------------------------------------------------------------

    /// Ingiere el texto ya extraído de un documento. La ingesta parcial
    /// (texto recortado, chunks sin embedding) es un resultado, no un error.
    pub async fn ingest_document(
        &self,
        subject: &str,
        title: &str,
        source: &str,
        text: &str,
    ) -> Result<IngestOutcome> {
        let mut outcome = IngestOutcome::default();

        // Recorte del texto extraído al máximo configurado.
        let text = if text.len() > self.max_text_bytes {
            warn!(
                "Texto de '{}' demasiado grande ({} bytes), recortando a {}",
                title,
                text.len(),
                self.max_text_bytes
            );
            outcome.truncated = true;
            truncate_at_char_boundary(text, self.max_text_bytes)
        } else {
            text
        };

        let mut raw_chunks = split_into_chunks(text, self.max_chunk_chars);
        if raw_chunks.is_empty() {
            return Err(TutorError::Extraction(format!(
                "El documento '{title}' no contiene texto útil"
            )));
        }

        // Recorte del número de chunks.
        if raw_chunks.len() > self.max_chunks_per_document {
            warn!(
                "Documento '{}' con {} chunks; descartando el exceso sobre {}",
                title,
                raw_chunks.len(),
                self.max_chunks_per_document
            );
            raw_chunks.truncate(self.max_chunks_per_document);
            outcome.truncated = true;
        }

        // Embeddings: primero en bloque; si el bloque falla entero, chunk a
        // chunk para poder saltar sólo los que fallen.
        let embedded: Vec<(String, Option<Vec<f64>>)> =
            match self.embedder.embed_texts(raw_chunks.clone()).await {
                Ok(vectors) => raw_chunks
                    .into_iter()
                    .zip(vectors.into_iter().map(Some))
                    .collect(),
                Err(err) => {
                    warn!("Embedding en bloque fallido ({err}); reintentando chunk a chunk");
                    let mut partial = Vec::new();
                    for chunk_text in raw_chunks {
                        let vector = match self
                            .embedder
                            .embed_texts(vec![chunk_text.clone()])
                            .await
                        {
                            Ok(mut v) if !v.is_empty() => Some(v.remove(0)),
                            Ok(_) => None,
                            Err(err) => {
                                warn!("Chunk sin embedding, se excluye de la búsqueda: {err}");
                                None
                            }
                        };
                        partial.push((chunk_text, vector));
                    }
                    partial
                }
            };

        let document = Document {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            title: title.to_string(),
            source: source.to_string(),
            ingested_at: Utc::now(),
        };
        outcome.document_id = Some(document.id);

        let mut inner = self.inner.write().unwrap();
        for (chunk_text, vector) in embedded {
            let Some(vector) = vector else {
                outcome.chunks_skipped += 1;
                continue;
            };

            // La dimensión del índice la fija el primer vector aceptado.
            match inner.dimension {
                None => inner.dimension = Some(vector.len()),
                Some(dim) if dim != vector.len() => {
                    warn!(
                        "Embedding de dimensión {} en un índice de dimensión {dim}; chunk saltado",
                        vector.len()
                    );
                    outcome.chunks_skipped += 1;
                    continue;
                }
                Some(_) => {}
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.chunks.push(Chunk {
                id: Uuid::new_v4(),
                document_id: document.id,
                subject: subject.to_string(),
                seq,
                text: chunk_text,
                embedding: vector,
            });
            outcome.chunks_created += 1;
        }
        inner.documents.insert(document.id, document);
        drop(inner);

        info!(
            "Ingerido '{}' ({}): {} chunks creados, {} saltados{}",
            title,
            subject,
            outcome.chunks_created,
            outcome.chunks_skipped,
            if outcome.truncated { ", con recorte" } else { "" }
        );
        Ok(outcome)
    }

    /// Recorre un directorio ingiriendo cada fichero soportado, informando
    /// del progreso en el `Status` compartido. Los fallos por fichero se
    /// registran y se saltan sin abortar el resto.
    pub async fn ingest_directory(
        &self,
        extractor: &dyn TextExtractor,
        subject: &str,
        root: &Path,
        status_arc: Arc<Mutex<Status>>,
    ) -> Result<IngestionSummary> {
        if !root.is_dir() {
            return Err(TutorError::InvalidInput(format!(
                "La ruta no es un directorio: {}",
                root.display()
            )));
        }

        let mut summary = IngestionSummary::default();
        let file_entries: Vec<_> = WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect();

        let total_files = file_entries.len() as f32;

        for (index, entry) in file_entries.iter().enumerate() {
            summary.files_scanned += 1;
            let path = entry.path();
            let filename = path.file_name().unwrap_or_default().to_string_lossy();
            let progress = (index + 1) as f32 / total_files;

            {
                let mut status = status_arc.lock().unwrap();
                status.message = format!(
                    "[{}/{}] Procesando: {}...",
                    index + 1,
                    total_files as u32,
                    filename
                );
                status.progress = progress;
            }

            match self.ingest_file(extractor, subject, path).await {
                Ok(outcome) => {
                    summary.files_ingested += 1;
                    summary.chunks_created += outcome.chunks_created;
                    summary.chunks_skipped += outcome.chunks_skipped;
                }
                Err(TutorError::UnsupportedFormat(ext)) => {
                    summary.files_skipped += 1;
                    info!("Saltando fichero con extensión no soportada ('{ext}'): {filename}");
                }
                Err(err) => {
                    summary.files_skipped += 1;
                    error!("Error ingiriendo {}: {err}", path.display());
                    let mut status = status_arc.lock().unwrap();
                    status.message = format!("ERROR en {}: {err}", path.display());
                    status.progress = progress;
                }
            }
        }

        Ok(summary)
    }

    async fn ingest_file(
        &self,
        extractor: &dyn TextExtractor,
        subject: &str,
        path: &Path,
    ) -> Result<IngestOutcome> {
        let extension = path
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or("")
            .to_lowercase();
        let bytes = fs::read(path)
            .map_err(|e| TutorError::Extraction(format!("No se pudo leer {}: {e}", path.display())))?;

        // Un fallo de extracción aborta el documento entero (sin chunks parciales).
        let text = extractor.extract(&bytes, &extension)?;

        let title = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        self.ingest_document(subject, &title, &path.to_string_lossy(), &text)
            .await
    }

    // ---------------------------------------------------------------------
    // BÚSQUEDA Y MANTENIMIENTO
    // ---------------------------------------------------------------------

    /// Devuelve los `k` chunks más parecidos a `topic_text` dentro de la
    /// asignatura, ordenados por similitud descendente. Menos de `k` si el
    /// corpus es pequeño; vacío (sin error) si no hay corpus.
    pub async fn query(
        &self,
        topic_text: &str,
        subject: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        // Con el corpus vacío ni siquiera pedimos el embedding de la query.
        {
            let inner = self.inner.read().unwrap();
            if !inner.chunks.iter().any(|c| c.subject == subject) {
                return Ok(Vec::new());
            }
        }

        let mut vectors = self
            .embedder
            .embed_texts(vec![topic_text.to_string()])
            .await?;
        if vectors.is_empty() {
            return Err(TutorError::Embedding(
                "No se pudo generar el embedding de la consulta".to_string(),
            ));
        }
        let query_vec = vectors.remove(0);

        let inner = self.inner.read().unwrap();
        let mut scored: Vec<ScoredChunk> = inner
            .chunks
            .iter()
            .filter(|c| c.subject == subject)
            .map(|c| ScoredChunk {
                chunk_id: c.id,
                document_id: c.document_id,
                score: cosine_similarity(&query_vec, &c.embedding),
                seq: c.seq,
                text: c.text.clone(),
            })
            .collect();

        // Similitud descendente; a igualdad, el chunk más reciente primero.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.seq.cmp(&a.seq))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Borra un documento y todos sus chunks y embeddings.
    pub fn delete_document(&self, document_id: Uuid) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.documents.remove(&document_id).is_none() {
            return false;
        }
        inner.chunks.retain(|c| c.document_id != document_id);
        info!("Documento {document_id} eliminado del índice");
        true
    }

    pub fn list_documents(&self) -> Vec<Document> {
        let inner = self.inner.read().unwrap();
        let mut docs: Vec<Document> = inner.documents.values().cloned().collect();
        docs.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at));
        docs
    }
}

/// Similitud coseno entre dos vectores de la misma dimensión.
fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Trocea el texto por párrafos en chunks de como máximo `max_chars`.
/// Un párrafo que por sí solo supere el límite se parte en seco.
fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        for piece in split_long_paragraph(paragraph, max_chars) {
            if current.len() + piece.len() + 2 > max_chars && !current.is_empty() {
                chunks.push(current.clone());
                current.clear();
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(piece);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Parte un párrafo más largo que `max_chars` en trozos del tamaño límite,
/// respetando fronteras de carácter UTF-8.
fn split_long_paragraph(paragraph: &str, max_chars: usize) -> Vec<&str> {
    if paragraph.len() <= max_chars {
        return vec![paragraph];
    }
    let mut pieces = Vec::new();
    let mut rest = paragraph;
    while rest.len() > max_chars {
        let cut = truncate_at_char_boundary(rest, max_chars);
        pieces.push(cut);
        rest = &rest[cut.len()..];
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

/// Prefijo de como máximo `max_bytes` acabado en frontera de carácter.
fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

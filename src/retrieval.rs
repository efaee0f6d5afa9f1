//! Ensamblado del contexto de grounding a partir de los chunks recuperados.
//!
//! Los chunks llegan ya ordenados por similitud descendente desde el índice;
//! aquí se concatenan en un único bloque acotado por un presupuesto de
//! caracteres. Si el bloque se pasa de presupuesto, se descarta primero el
//! chunk de menor similitud, hasta caber.

use uuid::Uuid;

use crate::index::ScoredChunk;

const CHUNK_SEPARATOR: &str = "\n\n---\n\n";

/// Bloque de contexto listo para insertar en el prompt, junto con los
/// identificadores de los chunks que acabaron incluidos.
#[derive(Debug, Clone, Default)]
pub struct GroundingContext {
    pub text: String,
    pub chunk_ids: Vec<Uuid>,
}

impl GroundingContext {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Concatena los chunks (en orden de similitud) sin superar `max_chars`.
/// Con presupuesto insuficiente incluso para el mejor chunk, el contexto
/// queda vacío y la generación continúa sin grounding.
pub fn assemble_context(hits: &[ScoredChunk], max_chars: usize) -> GroundingContext {
    let mut kept: Vec<&ScoredChunk> = hits.iter().collect();

    while !kept.is_empty() && total_len(&kept) > max_chars {
        // El último es el de menor similitud: fuera.
        kept.pop();
    }

    let text = kept
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join(CHUNK_SEPARATOR);

    GroundingContext {
        chunk_ids: kept.iter().map(|c| c.chunk_id).collect(),
        text,
    }
}

fn total_len(chunks: &[&ScoredChunk]) -> usize {
    let body: usize = chunks.iter().map(|c| c.text.len()).sum();
    body + CHUNK_SEPARATOR.len() * chunks.len().saturating_sub(1)
}

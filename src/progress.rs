//! Exportación e importación del progreso de un usuario.
//!
//! La exportación es un documento JSON versionado con los registros de
//! maestría y los resúmenes de sesión. La importación valida el documento
//! completo antes de tocar el almacén: o se aplica entero (según la
//! estrategia de fusión elegida) o no se aplica nada.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TutorError};
use crate::models::{MasteryRecord, SessionSummary};
use crate::store::ProgressStore;

pub const EXPORT_VERSION: &str = "1.0";

/// Caracteres vetados en los campos de texto importados; el mismo conjunto
/// que aplica el orquestador a la entrada directa del usuario.
const DANGEROUS_CHARS: [char; 6] = ['<', '>', '"', '\'', ';', '\\'];

/// Documento de exportación de progreso.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressExport {
    pub export_version: String,
    pub export_date: DateTime<Utc>,
    pub user: String,
    pub progress: Vec<MasteryRecord>,
    pub sessions: Vec<SessionSummary>,
}

/// Cómo resolver colisiones con registros ya existentes al importar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// El registro existente gana siempre.
    KeepExisting,
    /// El registro importado gana siempre.
    Overwrite,
    /// Gana el registro con `last_practiced` más reciente; en empate se
    /// conserva el existente.
    MergeByRecency,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub progress_imported: usize,
    pub progress_skipped: usize,
    pub sessions_imported: usize,
}

/// Construye el documento de exportación para un usuario a partir del
/// almacén de progreso.
pub fn export_progress(store: &dyn ProgressStore, user: &str) -> ProgressExport {
    ProgressExport {
        export_version: EXPORT_VERSION.to_string(),
        export_date: Utc::now(),
        user: user.to_string(),
        progress: store.list_mastery(user),
        sessions: store.list_session_summaries(user),
    }
}

/// Importa un documento de exportación sobre el usuario indicado.
///
/// La validación es completa y previa: ante cualquier defecto del documento
/// se devuelve `ImportValidation` sin haber mutado nada.
pub fn import_progress(
    store: &dyn ProgressStore,
    user: &str,
    raw: &str,
    strategy: MergeStrategy,
) -> Result<ImportReport> {
    let export: ProgressExport = serde_json::from_str(raw)
        .map_err(|e| TutorError::ImportValidation(format!("JSON malformado: {e}")))?;

    if export.export_version != EXPORT_VERSION {
        return Err(TutorError::ImportValidation(format!(
            "Versión de exportación no soportada: '{}' (se esperaba '{EXPORT_VERSION}')",
            export.export_version
        )));
    }

    let mut seen_keys = HashSet::new();
    for (i, record) in export.progress.iter().enumerate() {
        validate_text(&record.subject, &format!("progress[{i}].subject"))?;
        validate_text(&record.topic, &format!("progress[{i}].topic"))?;
        if !(0.0..=1.0).contains(&record.score) {
            return Err(TutorError::ImportValidation(format!(
                "progress[{i}].score fuera de [0,1]: {}",
                record.score
            )));
        }
        if !seen_keys.insert((record.subject.as_str(), record.topic.as_str())) {
            return Err(TutorError::ImportValidation(format!(
                "progress[{i}]: clave duplicada {} / {}",
                record.subject, record.topic
            )));
        }
    }
    for (i, summary) in export.sessions.iter().enumerate() {
        validate_text(&summary.subject, &format!("sessions[{i}].subject"))?;
        validate_text(&summary.topic, &format!("sessions[{i}].topic"))?;
        if summary.questions_correct > summary.questions_answered {
            return Err(TutorError::ImportValidation(format!(
                "sessions[{i}]: más aciertos que preguntas respondidas"
            )));
        }
    }

    // --- Documento válido: aplicar ---
    let mut report = ImportReport::default();

    for mut record in export.progress {
        // El registro se importa sobre el usuario destino, venga de quien
        // venga el fichero.
        record.user = user.to_string();

        let apply = match store.load_mastery(user, &record.subject, &record.topic) {
            None => true,
            Some(existing) => match strategy {
                MergeStrategy::KeepExisting => false,
                MergeStrategy::Overwrite => true,
                MergeStrategy::MergeByRecency => record.last_practiced > existing.last_practiced,
            },
        };

        if apply {
            store.upsert_mastery(record);
            report.progress_imported += 1;
        } else {
            report.progress_skipped += 1;
        }
    }

    for summary in export.sessions {
        store.append_session_summary(user, summary);
        report.sessions_imported += 1;
    }

    info!(
        "Importación de progreso para '{user}': {} registros aplicados, {} omitidos, {} sesiones",
        report.progress_imported, report.progress_skipped, report.sessions_imported
    );
    Ok(report)
}

fn validate_text(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TutorError::ImportValidation(format!("{field} está vacío")));
    }
    if value.chars().any(|c| DANGEROUS_CHARS.contains(&c)) {
        return Err(TutorError::ImportValidation(format!(
            "{field} contiene caracteres no permitidos"
        )));
    }
    Ok(())
}

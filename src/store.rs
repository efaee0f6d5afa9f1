//! Interfaz de persistencia del progreso y su implementación en memoria.
//!
//! El orquestador y la política de maestría no conocen el motor de
//! almacenamiento: emiten eventos sólo-añadir y leen/escriben registros de
//! maestría a través de `ProgressStore`. `MemoryStore` respalda la
//! aplicación y los tests; un backend duradero implementaría el mismo trait.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::models::{MasteryRecord, SessionEvent, SessionSummary};

pub trait ProgressStore: Send + Sync {
    /// Registra un evento de transición. El log es sólo-añadir: nada lo
    /// reescribe ni lo borra.
    fn append_event(&self, event: SessionEvent);

    fn load_mastery(&self, user: &str, subject: &str, topic: &str) -> Option<MasteryRecord>;

    fn upsert_mastery(&self, record: MasteryRecord);

    /// Registros de maestría del usuario, ordenados por (asignatura, tema)
    /// para que la exportación sea determinista.
    fn list_mastery(&self, user: &str) -> Vec<MasteryRecord>;

    fn append_session_summary(&self, user: &str, summary: SessionSummary);

    fn list_session_summaries(&self, user: &str) -> Vec<SessionSummary>;
}

#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<SessionEvent>>,
    mastery: RwLock<HashMap<(String, String, String), MasteryRecord>>,
    summaries: RwLock<HashMap<String, Vec<SessionSummary>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copia del log de eventos (para observabilidad y tests).
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.read().unwrap().clone()
    }
}

impl ProgressStore for MemoryStore {
    fn append_event(&self, event: SessionEvent) {
        self.events.write().unwrap().push(event);
    }

    fn load_mastery(&self, user: &str, subject: &str, topic: &str) -> Option<MasteryRecord> {
        self.mastery
            .read()
            .unwrap()
            .get(&(user.to_string(), subject.to_string(), topic.to_string()))
            .cloned()
    }

    fn upsert_mastery(&self, record: MasteryRecord) {
        let key = (
            record.user.clone(),
            record.subject.clone(),
            record.topic.clone(),
        );
        self.mastery.write().unwrap().insert(key, record);
    }

    fn list_mastery(&self, user: &str) -> Vec<MasteryRecord> {
        let mut records: Vec<MasteryRecord> = self
            .mastery
            .read()
            .unwrap()
            .values()
            .filter(|r| r.user == user)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.subject
                .cmp(&b.subject)
                .then_with(|| a.topic.cmp(&b.topic))
        });
        records
    }

    fn append_session_summary(&self, user: &str, summary: SessionSummary) {
        self.summaries
            .write()
            .unwrap()
            .entry(user.to_string())
            .or_default()
            .push(summary);
    }

    fn list_session_summaries(&self, user: &str) -> Vec<SessionSummary> {
        self.summaries
            .read()
            .unwrap()
            .get(user)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Difficulty;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn mastery_roundtrip_and_deterministic_listing() {
        let store = MemoryStore::new();
        store.upsert_mastery(MasteryRecord::new("ana", "rust", "traits", Difficulty::Beginner));
        store.upsert_mastery(MasteryRecord::new("ana", "rust", "borrowck", Difficulty::Beginner));
        store.upsert_mastery(MasteryRecord::new("luis", "rust", "traits", Difficulty::Advanced));

        let loaded = store.load_mastery("ana", "rust", "traits").unwrap();
        assert_eq!(loaded.topic, "traits");

        let listed = store.list_mastery("ana");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].topic, "borrowck");
        assert_eq!(listed[1].topic, "traits");
    }

    #[test]
    fn event_log_is_append_only_in_order() {
        let store = MemoryStore::new();
        let session_id = Uuid::new_v4();
        for i in 0..3 {
            store.append_event(SessionEvent::QuestionAsked {
                session_id,
                question_id: Uuid::new_v4(),
                difficulty: Difficulty::Beginner,
                timestamp: Utc::now() + chrono::Duration::seconds(i),
            });
        }
        let events = store.events();
        assert_eq!(events.len(), 3);
    }
}

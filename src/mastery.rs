//! Política de maestría: convierte el histórico de intentos en una decisión
//! de dificultad.
//!
//! La señal es una ventana de los últimos N veredictos, puntuada como
//! fracción de aciertos ponderada hacia lo reciente (decaimiento
//! exponencial). La dificultad sube tras `threshold_up` aciertos seguidos y
//! baja tras `threshold_down` fallos seguidos, siempre de un nivel como
//! máximo por evaluación y sin salirse de [Beginner, Advanced]. Ante señales
//! mixtas no se cambia nada: la estabilidad gana a la oscilación.
//!
//! Función pura sobre el registro: nunca falla.

use chrono::Utc;

use crate::config::AppConfig;
use crate::models::{Difficulty, MasteryRecord};

/// Resultado de una evaluación, para observabilidad del orquestador.
#[derive(Debug, Clone, Copy)]
pub struct MasteryUpdate {
    pub difficulty: Difficulty,
    pub score: f64,
    pub difficulty_changed: bool,
}

#[derive(Debug, Clone)]
pub struct MasteryPolicy {
    window: usize,
    decay: f64,
    threshold_up: u32,
    threshold_down: u32,
}

impl MasteryPolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            window: cfg.mastery_window,
            decay: cfg.mastery_decay,
            threshold_up: cfg.threshold_up,
            threshold_down: cfg.threshold_down,
        }
    }

    /// Incorpora un veredicto al registro y decide la siguiente dificultad.
    pub fn evaluate(&self, record: &mut MasteryRecord, is_correct: bool) -> MasteryUpdate {
        record.window.push_back(is_correct);
        while record.window.len() > self.window {
            record.window.pop_front();
        }

        if is_correct {
            record.consecutive_correct += 1;
            record.consecutive_incorrect = 0;
        } else {
            record.consecutive_incorrect += 1;
            record.consecutive_correct = 0;
        }

        record.score = self.weighted_score(record);
        record.times_practiced += 1;
        record.last_practiced = Utc::now();

        let previous = record.difficulty;
        if record.consecutive_correct >= self.threshold_up {
            record.difficulty = previous.step_up();
            record.consecutive_correct = 0;
            record.consecutive_incorrect = 0;
        } else if record.consecutive_incorrect >= self.threshold_down {
            record.difficulty = previous.step_down();
            record.consecutive_correct = 0;
            record.consecutive_incorrect = 0;
        }

        MasteryUpdate {
            difficulty: record.difficulty,
            score: record.score,
            difficulty_changed: record.difficulty != previous,
        }
    }

    /// Fracción de aciertos en la ventana, con peso `decay^edad` (el intento
    /// más reciente pesa 1). Siempre en [0,1].
    fn weighted_score(&self, record: &MasteryRecord) -> f64 {
        let mut weight = 1.0;
        let mut total = 0.0;
        let mut correct = 0.0;
        for verdict in record.window.iter().rev() {
            total += weight;
            if *verdict {
                correct += weight;
            }
            weight *= self.decay;
        }
        if total == 0.0 {
            0.0
        } else {
            correct / total
        }
    }
}

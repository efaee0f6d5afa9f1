//! Limitador de llamadas al LLM: ventana deslizante por usuario.
//!
//! Dos controles independientes: como máximo M llamadas por usuario dentro
//! de la ventana (por defecto 30 por minuto), y una longitud máxima de
//! prompt por llamada. Una denegación no consume hueco en la ventana.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::error::{Result, TutorError};

pub struct RateLimiter {
    window: Duration,
    max_calls: u32,
    max_prompt_chars: usize,
    /// Instantes de las llamadas recientes por usuario. El Mutex serializa
    /// adquisiciones concurrentes desde varias sesiones del mismo usuario.
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            window: cfg.rate_window,
            max_calls: cfg.rate_max_calls,
            max_prompt_chars: cfg.max_prompt_chars,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Pide permiso para una llamada al LLM. Si se concede, la llamada queda
    /// anotada en la ventana del usuario; si se deniega, no consume hueco.
    pub fn acquire(&self, user: &str, prompt_len: usize) -> Result<()> {
        self.acquire_at(user, prompt_len, Instant::now())
    }

    fn acquire_at(&self, user: &str, prompt_len: usize, now: Instant) -> Result<()> {
        // El control de tamaño es independiente del de frecuencia.
        if prompt_len > self.max_prompt_chars {
            return Err(TutorError::PromptTooLarge {
                len: prompt_len,
                max: self.max_prompt_chars,
            });
        }

        let mut calls = self.calls.lock().unwrap();
        let recent = calls.entry(user.to_string()).or_default();

        // Expulsa de la ventana las llamadas que ya han caducado.
        while let Some(&oldest) = recent.front() {
            if now.duration_since(oldest) >= self.window {
                recent.pop_front();
            } else {
                break;
            }
        }

        if recent.len() >= self.max_calls as usize {
            let oldest = recent.front().copied().unwrap_or(now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(TutorError::RateLimitExceeded {
                retry_after_secs: retry_after.as_secs().max(1),
            });
        }

        recent.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_calls: u32) -> RateLimiter {
        let mut cfg = AppConfig::for_tests();
        cfg.rate_max_calls = max_calls;
        RateLimiter::from_config(&cfg)
    }

    #[test]
    fn third_call_in_window_is_denied_and_allowed_after_it_expires() {
        let limiter = limiter(2);
        let t0 = Instant::now();

        assert!(limiter.acquire_at("ana", 100, t0).is_ok());
        assert!(limiter.acquire_at("ana", 100, t0 + Duration::from_secs(5)).is_ok());

        let denied = limiter.acquire_at("ana", 100, t0 + Duration::from_secs(10));
        assert!(matches!(denied, Err(TutorError::RateLimitExceeded { .. })));

        // Pasados 60 s desde la primera llamada, vuelve a haber hueco.
        assert!(limiter.acquire_at("ana", 100, t0 + Duration::from_secs(61)).is_ok());
    }

    #[test]
    fn denial_does_not_consume_a_slot() {
        let limiter = limiter(1);
        let t0 = Instant::now();

        assert!(limiter.acquire_at("ana", 10, t0).is_ok());
        for i in 0..5 {
            let denied = limiter.acquire_at("ana", 10, t0 + Duration::from_secs(i));
            assert!(denied.is_err());
        }
        // La única llamada anotada sigue siendo la primera: caduca a los 60 s.
        assert!(limiter.acquire_at("ana", 10, t0 + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn oversized_prompt_is_rejected_without_touching_the_window() {
        let limiter = limiter(1);
        let t0 = Instant::now();

        let err = limiter.acquire_at("ana", 6000, t0).unwrap_err();
        assert!(matches!(err, TutorError::PromptTooLarge { len: 6000, max: 5000 }));

        // El rechazo por tamaño no gastó la cuota.
        assert!(limiter.acquire_at("ana", 100, t0).is_ok());
    }

    #[test]
    fn users_have_independent_windows() {
        let limiter = limiter(1);
        let t0 = Instant::now();

        assert!(limiter.acquire_at("ana", 10, t0).is_ok());
        assert!(limiter.acquire_at("luis", 10, t0).is_ok());
        assert!(limiter.acquire_at("ana", 10, t0 + Duration::from_secs(1)).is_err());
    }
}

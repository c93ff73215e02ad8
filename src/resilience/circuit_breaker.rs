//! Circuit Breaker mit Retry/Backoff
//!
//! `closed → open → half-open → closed`. Jeder fehlgeschlagene Versuch
//! zählt; ab der Schwelle öffnet der Breaker und weist Aufrufe ab, ohne
//! die Operation auszuführen. Nach dem Reset-Timeout läuft genau ein
//! Probeaufruf.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Breaker offen, Operation wurde nicht ausgeführt
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Die Operation selbst ist fehlgeschlagen
    #[error("{0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CircuitBreakerError::ServiceUnavailable(_))
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Fehlversuche bis zum Öffnen
    pub failure_threshold: u32,
    /// Wie lange der Breaker offen bleibt
    pub reset_timeout_ms: u64,
    /// Wiederholungen nach dem ersten Versuch
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Zufälliger Aufschlag als Anteil der Wartezeit (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: 0.0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Wartezeit vor Wiederholung `attempt` (0-basiert), ohne Jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay_ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

enum Admission {
    Normal,
    Trial,
    Rejected,
}

/// Gibt den Probe-Slot frei, falls der Probeaufruf abgebrochen wird
struct TrialGuard<'a> {
    state: &'a Mutex<BreakerState>,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().trial_in_flight = false;
        }
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.state.lock().last_failure
    }

    /// Setzt den Breaker manuell zurück
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.last_failure = None;
        state.opened_at = None;
        state.trial_in_flight = false;
        tracing::info!("Circuit breaker '{}' manually reset", self.name);
    }

    /// Führt die Operation geschützt aus
    pub async fn call<F, Fut, T, E>(&self, mut operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        match self.admit() {
            Admission::Rejected => Err(CircuitBreakerError::ServiceUnavailable(format!(
                "circuit '{}' is open",
                self.name
            ))),
            Admission::Trial => {
                let mut guard = TrialGuard {
                    state: &self.state,
                    armed: true,
                };
                let result = operation().await;
                guard.armed = false;
                match result {
                    Ok(value) => {
                        self.record_success();
                        Ok(value)
                    }
                    Err(e) => {
                        tracing::warn!("Circuit breaker '{}' trial call failed: {}", self.name, e);
                        self.record_failure();
                        Err(CircuitBreakerError::Operation(e))
                    }
                }
            }
            Admission::Normal => self.call_with_retries(&mut operation).await,
        }
    }

    async fn call_with_retries<F, Fut, T, E>(
        &self,
        operation: &mut F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    self.record_failure();

                    // Breaker offen (auch durch parallele Aufrufer) oder Versuche erschöpft
                    if self.state() != CircuitState::Closed || attempt >= self.config.max_retries {
                        return Err(CircuitBreakerError::Operation(e));
                    }

                    let delay = self.jittered(self.config.backoff_delay(attempt));
                    tracing::debug!(
                        "Circuit breaker '{}': attempt {} failed ({}), retrying in {:?}",
                        self.name,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn admit(&self) -> Admission {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout() {
                    state.state = CircuitState::HalfOpen;
                    state.trial_in_flight = true;
                    tracing::info!("Circuit breaker '{}' half-open, allowing trial call", self.name);
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen if state.trial_in_flight => Admission::Rejected,
            CircuitState::HalfOpen => {
                state.trial_in_flight = true;
                Admission::Trial
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        if state.state != CircuitState::Closed {
            tracing::info!("Circuit breaker '{}' closed after successful trial", self.name);
        }
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.opened_at = None;
        state.trial_in_flight = false;
    }

    fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure = Some(now);

        let reopen = state.state == CircuitState::HalfOpen;
        let trip =
            state.state == CircuitState::Closed && state.failure_count >= self.config.failure_threshold;

        if reopen || trip {
            state.state = CircuitState::Open;
            state.opened_at = Some(now);
            state.trial_in_flight = false;
            tracing::warn!(
                "Circuit breaker '{}' opened after {} failures",
                self.name,
                state.failure_count
            );
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let max_extra = (delay.as_millis() as f64 * jitter) as u64;
        let extra = rand::thread_rng().gen_range(0..=max_extra);
        delay.saturating_add(Duration::from_millis(extra))
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn config(failure_threshold: u32, max_retries: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            reset_timeout_ms: 1_000,
            max_retries,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: 0.0,
        }
    }

    type TestResult<T> = Result<T, CircuitBreakerError<&'static str>>;

    async fn failing(breaker: &CircuitBreaker, calls: &Arc<AtomicU32>) -> TestResult<()> {
        breaker
            .call(|| {
                let calls = Arc::clone(calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                }
            })
            .await
    }

    async fn succeeding(breaker: &CircuitBreaker, calls: &Arc<AtomicU32>) -> TestResult<u32> {
        breaker
            .call(|| {
                let calls = Arc::clone(calls);
                async move { Ok::<_, &'static str>(calls.fetch_add(1, Ordering::SeqCst) + 1) }
            })
            .await
    }

    async fn open_breaker(breaker: &CircuitBreaker) {
        let calls = Arc::new(AtomicU32::new(0));
        while breaker.state() != CircuitState::Open {
            let _ = failing(breaker, &calls).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("signaling", config(3, 0));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            assert!(matches!(
                failing(&breaker, &calls).await,
                Err(CircuitBreakerError::Operation("boom"))
            ));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);

        let result = succeeding(&breaker, &calls).await;
        assert!(result.as_ref().is_err_and(|e| e.is_unavailable()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_once_open() {
        let breaker = CircuitBreaker::new("signaling", config(2, 5));
        let calls = Arc::new(AtomicU32::new(0));

        assert!(failing(&breaker, &calls).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("signaling", config(2, 0));
        open_breaker(&breaker).await;

        tokio::time::advance(Duration::from_millis(1_000)).await;

        let calls = Arc::new(AtomicU32::new(0));
        assert_eq!(succeeding(&breaker, &calls).await.unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("signaling", config(2, 3));
        open_breaker(&breaker).await;
        let opened_failure = breaker.last_failure().unwrap();

        tokio::time::advance(Duration::from_millis(1_500)).await;

        let calls = Arc::new(AtomicU32::new(0));
        assert!(matches!(
            failing(&breaker, &calls).await,
            Err(CircuitBreakerError::Operation(_))
        ));
        // Probeaufruf ohne Wiederholungen
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.last_failure().unwrap() > opened_failure);

        assert!(succeeding(&breaker, &calls).await.unwrap_err().is_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_trial_call() {
        let breaker = Arc::new(CircuitBreaker::new("signaling", config(1, 0)));
        open_breaker(&breaker).await;
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let trial = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .call(|| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, &'static str>(())
                    })
                    .await
            })
        };

        while breaker.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        let calls = Arc::new(AtomicU32::new(0));
        assert!(succeeding(&breaker, &calls).await.unwrap_err().is_unavailable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(trial.await.unwrap().is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff_between_retries() {
        let breaker = CircuitBreaker::new("signaling", config(10, 3));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = breaker
            .call(|| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("flaky")
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(350));
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let config = CircuitBreakerConfig {
            base_delay_ms: 500,
            max_delay_ms: 2_000,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(config.backoff_delay(40), Duration::from_millis(2_000));
    }

    #[test]
    fn test_manual_reset() {
        let breaker = CircuitBreaker::new("signaling", config(1, 0));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.last_failure().is_none());
    }
}

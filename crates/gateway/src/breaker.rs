//! Per-provider circuit breakers.
//!
//! Closed → open after N consecutive failures; open refuses dispatch
//! locally until the reset timeout elapses; half-open admits a bounded
//! number of probes. A probe success closes the breaker, a probe failure
//! re-opens it. Each entry transitions under its own lock, which is
//! never held across an await point.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use llmrouter_core::error::GatewayError;
use llmrouter_core::event::{EventBus, GatewayEvent};
use llmrouter_telemetry::MetricsRegistry;

/// Breaker tuning, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub threshold: u32,
    /// How long an open breaker refuses dispatch.
    pub reset_timeout: Duration,
    /// Probes admitted while half-open.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_issued: u32,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probes_issued: 0,
        }
    }
}

/// The per-provider breaker table.
pub struct CircuitBreakers {
    entries: DashMap<String, Mutex<BreakerInner>>,
    config: BreakerConfig,
    events: Arc<EventBus>,
    metrics: Arc<MetricsRegistry>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig, events: Arc<EventBus>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            events,
            metrics,
        }
    }

    /// May a dispatch to this provider proceed? Refusals are local —
    /// no network call happens — and never count as provider failures.
    pub fn try_acquire(&self, provider: &str) -> Result<(), GatewayError> {
        let entry = self
            .entries
            .entry(provider.to_string())
            .or_insert_with(|| Mutex::new(BreakerInner::new()));
        let mut inner = entry.lock().unwrap_or_else(|e| e.into_inner());

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    info!(provider, "Circuit half-open, admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_issued = 1;
                    Ok(())
                } else {
                    Err(GatewayError::ProviderUnavailable {
                        provider: provider.to_string(),
                        message: format!(
                            "circuit open, retry in {}s",
                            (self.config.reset_timeout - elapsed).as_secs().max(1)
                        ),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_issued < self.config.half_open_probes {
                    inner.probes_issued += 1;
                    Ok(())
                } else {
                    Err(GatewayError::ProviderUnavailable {
                        provider: provider.to_string(),
                        message: "circuit half-open, probe already in flight".into(),
                    })
                }
            }
        }
    }

    /// A dispatch succeeded: reset the failure streak; a half-open probe
    /// success closes the breaker.
    pub fn record_success(&self, provider: &str) {
        let Some(entry) = self.entries.get(provider) else {
            return;
        };
        let mut inner = entry.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            info!(provider, "Circuit closed after successful probe");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.probes_issued = 0;
            self.metrics.record_circuit_transition(provider, false);
            self.events.publish(GatewayEvent::CircuitClosed {
                provider: provider.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    /// A dispatch failed in a way that counts against the provider.
    pub fn record_failure(&self, provider: &str) {
        let entry = self
            .entries
            .entry(provider.to_string())
            .or_insert_with(|| Mutex::new(BreakerInner::new()));
        let mut inner = entry.lock().unwrap_or_else(|e| e.into_inner());

        inner.consecutive_failures += 1;
        let should_open = match inner.state {
            // A failed probe re-opens immediately
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.threshold,
            CircuitState::Open => false,
        };

        if should_open {
            warn!(
                provider,
                failures = inner.consecutive_failures,
                threshold = self.config.threshold,
                "Circuit OPEN"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probes_issued = 0;
            self.metrics.record_circuit_transition(provider, true);
            self.events.publish(GatewayEvent::CircuitOpened {
                provider: provider.to_string(),
                consecutive_failures: inner.consecutive_failures,
                timestamp: Utc::now(),
            });
        }
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        self.entries
            .get(provider)
            .map(|e| e.lock().unwrap_or_else(|p| p.into_inner()).state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Consecutive-failure count, for the admin surface.
    pub fn failure_count(&self, provider: &str) -> u32 {
        self.entries
            .get(provider)
            .map(|e| {
                e.lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .consecutive_failures
            })
            .unwrap_or(0)
    }

    /// Providers whose circuit currently refuses dispatch. Open
    /// breakers past their reset timeout are NOT listed; the router may
    /// consider them so the probe can happen.
    pub fn refusing_providers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for entry in self.entries.iter() {
            let inner = entry.value().lock().unwrap_or_else(|e| e.into_inner());
            let refusing = match inner.state {
                CircuitState::Open => inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() < self.config.reset_timeout),
                _ => false,
            };
            if refusing {
                out.insert(entry.key().clone());
            }
        }
        out
    }

    /// All states, for `/admin/stats`.
    pub fn states(&self) -> Vec<(String, CircuitState, u32)> {
        let mut out: Vec<(String, CircuitState, u32)> = self
            .entries
            .iter()
            .map(|entry| {
                let inner = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                (entry.key().clone(), inner.state, inner.consecutive_failures)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers(threshold: u32, reset_ms: u64) -> CircuitBreakers {
        CircuitBreakers::new(
            BreakerConfig {
                threshold,
                reset_timeout: Duration::from_millis(reset_ms),
                half_open_probes: 1,
            },
            Arc::new(EventBus::default()),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = breakers(3, 60_000);
        cb.record_failure("p");
        cb.record_failure("p");
        assert_eq!(cb.state("p"), CircuitState::Closed);
        assert!(cb.try_acquire("p").is_ok());

        cb.record_failure("p");
        assert_eq!(cb.state("p"), CircuitState::Open);
        assert!(cb.try_acquire("p").is_err());
        assert_eq!(cb.failure_count("p"), 3);
    }

    #[test]
    fn success_resets_the_streak() {
        let cb = breakers(3, 60_000);
        cb.record_failure("p");
        cb.record_failure("p");
        cb.record_success("p");
        cb.record_failure("p");
        cb.record_failure("p");
        assert_eq!(cb.state("p"), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let cb = breakers(1, 20);
        cb.record_failure("p");
        assert!(cb.try_acquire("p").is_err());

        std::thread::sleep(Duration::from_millis(30));
        // First arrival becomes the probe, the second is refused
        assert!(cb.try_acquire("p").is_ok());
        assert_eq!(cb.state("p"), CircuitState::HalfOpen);
        assert!(cb.try_acquire("p").is_err());
    }

    #[test]
    fn probe_success_closes_probe_failure_reopens() {
        let cb = breakers(1, 20);
        cb.record_failure("p");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.try_acquire("p").is_ok());
        cb.record_success("p");
        assert_eq!(cb.state("p"), CircuitState::Closed);

        cb.record_failure("p");
        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.try_acquire("p").is_ok());
        cb.record_failure("p");
        assert_eq!(cb.state("p"), CircuitState::Open);
    }

    #[test]
    fn refusing_set_excludes_expired_open_breakers() {
        let cb = breakers(1, 20);
        cb.record_failure("p");
        assert!(cb.refusing_providers().contains("p"));

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.refusing_providers().is_empty());
    }

    #[tokio::test]
    async fn transitions_publish_events() {
        let events = Arc::new(EventBus::default());
        let cb = CircuitBreakers::new(
            BreakerConfig {
                threshold: 1,
                reset_timeout: Duration::from_millis(10),
                half_open_probes: 1,
            },
            events.clone(),
            Arc::new(MetricsRegistry::new()),
        );
        let mut rx = events.subscribe();

        cb.record_failure("p");
        match rx.recv().await.unwrap().as_ref() {
            GatewayEvent::CircuitOpened { provider, .. } => assert_eq!(provider, "p"),
            other => panic!("unexpected event: {other:?}"),
        }

        std::thread::sleep(Duration::from_millis(20));
        cb.try_acquire("p").unwrap();
        cb.record_success("p");
        match rx.recv().await.unwrap().as_ref() {
            GatewayEvent::CircuitClosed { provider, .. } => assert_eq!(provider, "p"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

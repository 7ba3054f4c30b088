//! Per-source reconnect, backoff and circuit breaker supervision.
//!
//! ```text
//! Connected -> Reconnecting -> CircuitOpen -> Reconnecting -> Connected
//! ```
//!
//! Failures are absorbed here and surfaced only as [`SourceHealth`].

use crate::{config::SupervisorConfig, tick::SourceId};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

mod backoff;
mod runner;
mod timeout;

pub use backoff::ExponentialBackoff;
pub use runner::run_source;
pub use timeout::TimeoutStream;

/// Connection state of one upstream source.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Display)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    CircuitOpen,
}

/// Health of one upstream source, mutated only by its [`ConnectionSupervisor`].
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct SourceHealth {
    pub source_id: SourceId,
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    pub last_success_time: Option<DateTime<Utc>>,
}

impl SourceHealth {
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            state: ConnectionState::Reconnecting,
            consecutive_failures: 0,
            last_success_time: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// What the caller must wait before the next connection attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReconnectAction {
    /// Wait, then attempt again.
    Backoff(Duration),
    /// The circuit is open. Wait for the cool-down, call
    /// [`ConnectionSupervisor::on_cool_down_elapsed`], then make a single probe attempt.
    CoolDown(Duration),
}

impl ReconnectAction {
    pub fn delay(&self) -> Duration {
        match self {
            ReconnectAction::Backoff(delay) | ReconnectAction::CoolDown(delay) => *delay,
        }
    }
}

/// Reconnect/backoff/circuit breaker state machine of one source.
///
/// Starts in `Reconnecting` since no connection has been established yet.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    health: SourceHealth,
    backoff: ExponentialBackoff,
    half_open: bool,
}

impl ConnectionSupervisor {
    pub fn new(source_id: SourceId, config: SupervisorConfig) -> Self {
        Self {
            backoff: ExponentialBackoff::from_config(&config),
            config,
            health: SourceHealth::new(source_id),
            half_open: false,
        }
    }

    pub fn health(&self) -> &SourceHealth {
        &self.health
    }

    pub fn state(&self) -> ConnectionState {
        self.health.state
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.config.heartbeat_timeout
    }

    /// Returns true while the current attempt is the single half-open probe.
    pub fn is_probing(&self) -> bool {
        self.half_open
    }

    /// The connection was re-established and delivered its first tick.
    pub fn on_established(&mut self, now: DateTime<Utc>) {
        if self.health.state != ConnectionState::Connected {
            info!(
                source = %self.health.source_id,
                previous = %self.health.state,
                failures = self.health.consecutive_failures,
                "source connected"
            );
        }
        self.health.state = ConnectionState::Connected;
        self.health.consecutive_failures = 0;
        self.health.last_success_time = Some(now);
        self.half_open = false;
        self.backoff.reset();
    }

    /// An established connection dropped (disconnect or heartbeat timeout).
    pub fn on_disconnect(&mut self) -> ReconnectAction {
        if self.health.state == ConnectionState::Connected {
            warn!(source = %self.health.source_id, "source disconnected, reconnecting");
        }
        self.health.state = ConnectionState::Reconnecting;
        ReconnectAction::Backoff(self.backoff.next_delay())
    }

    /// A connection attempt failed (including a connection that ended before its first tick).
    pub fn on_attempt_failed(&mut self) -> ReconnectAction {
        self.health.consecutive_failures = self.health.consecutive_failures.saturating_add(1);

        if self.half_open || self.health.consecutive_failures >= self.config.circuit_threshold {
            warn!(
                source = %self.health.source_id,
                failures = self.health.consecutive_failures,
                probe = self.half_open,
                cool_down_ms = u64::try_from(self.config.cool_down.as_millis()).unwrap_or(u64::MAX),
                "circuit open, pausing reconnect attempts"
            );
            self.health.state = ConnectionState::CircuitOpen;
            self.half_open = false;
            return ReconnectAction::CoolDown(self.config.cool_down);
        }

        self.health.state = ConnectionState::Reconnecting;
        let delay = self.backoff.next_delay();
        info!(
            source = %self.health.source_id,
            failures = self.health.consecutive_failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect attempt failed, backing off"
        );
        ReconnectAction::Backoff(delay)
    }

    /// The circuit breaker cool-down elapsed: allow exactly one half-open probe attempt.
    pub fn on_cool_down_elapsed(&mut self) {
        if self.health.state != ConnectionState::CircuitOpen {
            return;
        }
        info!(source = %self.health.source_id, "cool-down elapsed, probing source");
        self.health.state = ConnectionState::Reconnecting;
        self.half_open = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(circuit_threshold: u32) -> SupervisorConfig {
        SupervisorConfig {
            circuit_threshold,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: 0.0,
            cool_down: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_initial_state_is_reconnecting() {
        let supervisor = ConnectionSupervisor::new(SourceId::new("crypto"), config(5));
        assert_eq!(supervisor.state(), ConnectionState::Reconnecting);
        assert_eq!(supervisor.health().consecutive_failures, 0);
        assert_eq!(supervisor.health().last_success_time, None);
    }

    #[test]
    fn test_circuit_opens_after_exactly_k_failures() {
        for k in 1..=6 {
            let mut supervisor = ConnectionSupervisor::new(SourceId::new("crypto"), config(k));

            for failure in 1..k {
                let action = supervisor.on_attempt_failed();
                assert!(matches!(action, ReconnectAction::Backoff(_)), "K={k} failure {failure}");
                assert_eq!(supervisor.state(), ConnectionState::Reconnecting);
            }

            assert_eq!(
                supervisor.on_attempt_failed(),
                ReconnectAction::CoolDown(Duration::from_secs(30)),
                "K={k}"
            );
            assert_eq!(supervisor.state(), ConnectionState::CircuitOpen);
            assert_eq!(supervisor.health().consecutive_failures, k);
        }
    }

    #[test]
    fn test_one_probe_per_cool_down() {
        let mut supervisor = ConnectionSupervisor::new(SourceId::new("futures"), config(3));
        for _ in 0..3 {
            supervisor.on_attempt_failed();
        }
        assert_eq!(supervisor.state(), ConnectionState::CircuitOpen);

        for _ in 0..4 {
            supervisor.on_cool_down_elapsed();
            assert_eq!(supervisor.state(), ConnectionState::Reconnecting);
            assert!(supervisor.is_probing());

            // The single probe fails: straight back to CircuitOpen
            assert!(matches!(supervisor.on_attempt_failed(), ReconnectAction::CoolDown(_)));
            assert_eq!(supervisor.state(), ConnectionState::CircuitOpen);
            assert!(!supervisor.is_probing());
        }
    }

    #[test]
    fn test_successful_probe_closes_circuit() {
        let mut supervisor = ConnectionSupervisor::new(SourceId::new("futures"), config(2));
        supervisor.on_attempt_failed();
        supervisor.on_attempt_failed();
        supervisor.on_cool_down_elapsed();
        supervisor.on_established(now());

        let health = supervisor.health();
        assert_eq!(health.state, ConnectionState::Connected);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.last_success_time, Some(now()));

        // Backoff restarts from the initial delay after a disconnect
        assert_eq!(
            supervisor.on_disconnect(),
            ReconnectAction::Backoff(Duration::from_millis(100))
        );
        assert_eq!(supervisor.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_backoff_grows_between_failures() {
        let mut supervisor = ConnectionSupervisor::new(SourceId::new("crypto"), config(10));
        let delays = (0..5)
            .map(|_| supervisor.on_attempt_failed().delay())
            .collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn test_cool_down_elapsed_ignored_unless_circuit_open() {
        let mut supervisor = ConnectionSupervisor::new(SourceId::new("crypto"), config(5));
        supervisor.on_cool_down_elapsed();
        assert!(!supervisor.is_probing());
        assert_eq!(supervisor.state(), ConnectionState::Reconnecting);
    }
}

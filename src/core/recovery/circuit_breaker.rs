//! Per-operation circuit breakers.
//!
//! A breaker is created lazily for each operation name and lives for the
//! process lifetime unless reset. The open timer runs on `tokio::time`, so
//! paused-clock tests can step through the open duration.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Diagnostics view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub operation: String,
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub trial_outstanding: bool,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failures: u32,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    trial_outstanding: bool,
    /// Bumped on every open and close. Outcomes from permits granted under
    /// an earlier generation are ignored.
    generation: u64,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            opened_at: None,
            trial_outstanding: false,
            generation: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_outstanding = false;
        self.generation += 1;
    }

    fn close(&mut self) {
        let generation = self.generation + 1;
        *self = Breaker {
            generation,
            ..Breaker::new()
        };
    }
}

pub struct CircuitBreakers {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Asks to run `operation`. `None` means the breaker rejects it.
    pub fn admit(&self, operation: &str) -> Option<Permit<'_>> {
        let mut breakers = lock(&self.breakers);
        let breaker = breakers
            .entry(operation.to_string())
            .or_insert_with(Breaker::new);

        let trial = match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|opened| opened.elapsed())
                    .unwrap_or(self.config.open_duration);
                if elapsed < self.config.open_duration {
                    return None;
                }
                info!(operation, "circuit half-open; admitting one trial");
                breaker.state = CircuitState::HalfOpen;
                breaker.trial_outstanding = true;
                true
            }
            CircuitState::HalfOpen => {
                if breaker.trial_outstanding {
                    return None;
                }
                breaker.trial_outstanding = true;
                true
            }
        };

        Some(Permit {
            breakers: self,
            operation: operation.to_string(),
            trial,
            generation: breaker.generation,
            settled: false,
        })
    }

    fn record_success(&self, operation: &str, generation: u64) {
        let mut breakers = lock(&self.breakers);
        let Some(breaker) = current(&mut breakers, operation, generation) else {
            return;
        };
        if breaker.state != CircuitState::Closed {
            info!(operation, "circuit closed");
            breaker.close();
        } else {
            breaker.failures = 0;
            breaker.last_failure = None;
        }
    }

    fn record_failure(&self, operation: &str, generation: u64) {
        let mut breakers = lock(&self.breakers);
        let Some(breaker) = current(&mut breakers, operation, generation) else {
            return;
        };
        breaker.failures = breaker.failures.saturating_add(1);
        breaker.last_failure = Some(self.clock.now());

        match breaker.state {
            CircuitState::HalfOpen => {
                warn!(operation, "trial failed; circuit re-opened");
                breaker.open();
            }
            CircuitState::Closed if breaker.failures >= self.config.failure_threshold.max(1) => {
                warn!(operation, failures = breaker.failures, "circuit opened");
                breaker.open();
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    fn release(&self, operation: &str, trial: bool, generation: u64) {
        if !trial {
            return;
        }
        if let Some(breaker) = current(&mut lock(&self.breakers), operation, generation) {
            breaker.trial_outstanding = false;
        }
    }

    pub fn state(&self, operation: &str) -> CircuitState {
        lock(&self.breakers)
            .get(operation)
            .map(|breaker| breaker.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers = lock(&self.breakers);
        let mut snapshot: Vec<_> = breakers
            .iter()
            .map(|(operation, breaker)| BreakerSnapshot {
                operation: operation.clone(),
                state: breaker.state,
                failures: breaker.failures,
                last_failure: breaker.last_failure,
                trial_outstanding: breaker.trial_outstanding,
            })
            .collect();
        snapshot.sort_by(|a, b| a.operation.cmp(&b.operation));
        snapshot
    }

    pub fn reset(&self, operation: &str) {
        lock(&self.breakers).remove(operation);
    }

    pub fn reset_all(&self) {
        lock(&self.breakers).clear();
    }
}

/// The breaker for `operation`, unless it has moved on since `generation`.
fn current<'a>(
    breakers: &'a mut HashMap<String, Breaker>,
    operation: &str,
    generation: u64,
) -> Option<&'a mut Breaker> {
    let breaker = breakers.get_mut(operation)?;
    if breaker.generation != generation {
        debug!(operation, "ignoring outcome from an earlier circuit state");
        return None;
    }
    Some(breaker)
}

/// Permission to run one logical operation. Dropping it without an outcome
/// (cancellation) leaves the failure count alone and frees the half-open
/// trial slot.
#[must_use]
pub struct Permit<'a> {
    breakers: &'a CircuitBreakers,
    operation: String,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breakers.record_success(&self.operation, self.generation);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breakers.record_failure(&self.operation, self.generation);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers.release(&self.operation, self.trial, self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::system_clock;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(BreakerConfig::default(), system_clock())
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_recovers_through_a_trial() {
        let breakers = breakers();
        for _ in 0..4 {
            breakers.admit("chat").unwrap().fail();
        }
        assert_eq!(breakers.state("chat"), CircuitState::Closed);
        breakers.admit("chat").unwrap().fail();
        assert_eq!(breakers.state("chat"), CircuitState::Open);
        assert!(breakers.admit("chat").is_none());

        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = breakers.admit("chat").unwrap();
        assert!(trial.is_trial());
        assert_eq!(breakers.state("chat"), CircuitState::HalfOpen);
        assert!(breakers.admit("chat").is_none());

        trial.succeed();
        assert_eq!(breakers.state("chat"), CircuitState::Closed);
        let snapshot = breakers.snapshot();
        assert_eq!(snapshot[0].failures, 0);
        assert_eq!(snapshot[0].last_failure, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_a_fresh_timer() {
        let breakers = breakers();
        for _ in 0..5 {
            breakers.admit("chat").unwrap().fail();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        breakers.admit("chat").unwrap().fail();
        assert_eq!(breakers.state("chat"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breakers.admit("chat").is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breakers.admit("chat").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_the_slot_without_counting() {
        let breakers = breakers();
        for _ in 0..5 {
            breakers.admit("health").unwrap().fail();
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(breakers.admit("health").unwrap());
        assert_eq!(breakers.state("health"), CircuitState::HalfOpen);
        let retry = breakers.admit("health").unwrap();
        assert!(retry.is_trial());
        retry.succeed();
        assert_eq!(breakers.state("health"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn late_outcomes_from_before_the_trip_are_ignored() {
        let breakers = breakers();
        let early_success = breakers.admit("chat").unwrap();
        let early_failure = breakers.admit("chat").unwrap();
        for _ in 0..5 {
            breakers.admit("chat").unwrap().fail();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = breakers.admit("chat").unwrap();
        assert!(trial.is_trial());

        early_success.succeed();
        assert_eq!(breakers.state("chat"), CircuitState::HalfOpen);
        assert!(breakers.admit("chat").is_none());

        trial.fail();
        early_failure.fail();
        let snapshot = breakers.snapshot();
        assert_eq!(snapshot[0].state, CircuitState::Open);
        assert_eq!(snapshot[0].failures, 6);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breakers.admit("chat").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_failure_does_not_free_a_second_trial() {
        let breakers = breakers();
        let early = breakers.admit("chat").unwrap();
        for _ in 0..5 {
            breakers.admit("chat").unwrap().fail();
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        let trial = breakers.admit("chat").unwrap();

        early.fail();
        assert_eq!(breakers.state("chat"), CircuitState::HalfOpen);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breakers.admit("chat").is_none());
        assert!(breakers.snapshot()[0].trial_outstanding);
        trial.succeed();
        assert_eq!(breakers.state("chat"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_open_duration_stays_open() {
        let config = BreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::MAX,
        };
        let breakers = CircuitBreakers::new(config, system_clock());
        breakers.admit("chat").unwrap().fail();

        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(breakers.admit("chat").is_none());
        assert_eq!(breakers.state("chat"), CircuitState::Open);
    }

    #[test]
    fn breakers_are_independent_per_operation() {
        let breakers = breakers();
        for _ in 0..5 {
            breakers.admit("chat").unwrap().fail();
        }
        assert!(breakers.admit("chat").is_none());
        assert!(breakers.admit("errors").is_some());

        breakers.reset("chat");
        assert_eq!(breakers.state("chat"), CircuitState::Closed);
        breakers.reset_all();
        assert!(breakers.snapshot().is_empty());
    }
}

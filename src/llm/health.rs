// src/llm/health.rs
// Per-provider health ledger. Failed requests build up a penalty that
// decays exponentially with time; crossing the trip threshold takes the
// provider out of rotation for a window proportional to how bad things
// got. Rate-limit replies weigh double: the backend explicitly asked for
// breathing room.

use crate::llm::provider::Provider;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Penalty at which a provider leaves the rotation.
const TRIP_PENALTY: f64 = 3.0;

/// Penalty added by an ordinary failed request.
const ERROR_WEIGHT: f64 = 1.0;

/// Penalty added by a rate-limit reply.
const RATE_LIMIT_WEIGHT: f64 = 2.0;

/// Time for an untouched penalty to halve.
const PENALTY_HALF_LIFE: Duration = Duration::from_secs(90);

/// Exclusion window per unit of penalty at trip time.
const BLOCK_PER_PENALTY: Duration = Duration::from_secs(30);

/// Longest a provider sits out in one stretch.
const BLOCK_CAP: Duration = Duration::from_secs(5 * 60);

/// Penalties below this round down to zero when settling.
const PENALTY_FLOOR: f64 = 0.05;

#[derive(Debug, Clone)]
struct Health {
    penalty: f64,
    updated_at: Instant,
    blocked_until: Option<Instant>,
}

impl Health {
    fn new(now: Instant) -> Self {
        Self {
            penalty: 0.0,
            updated_at: now,
            blocked_until: None,
        }
    }

    /// Apply exponential decay for the time since the last event.
    fn settle(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated_at);
        if !elapsed.is_zero() && self.penalty > 0.0 {
            let halvings = elapsed.as_secs_f64() / PENALTY_HALF_LIFE.as_secs_f64();
            self.penalty *= 0.5_f64.powf(halvings);
            if self.penalty < PENALTY_FLOOR {
                self.penalty = 0.0;
            }
        }
        self.updated_at = now;
    }
}

/// Thread-safe provider health tracker consulted by the router before
/// every candidate model.
#[derive(Default)]
pub struct ProviderHealth {
    ledger: Mutex<HashMap<Provider, Health>>,
}

impl ProviderHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the provider is currently in rotation. An expired block is
    /// lifted here, but the residual penalty stays, so a provider fresh
    /// out of a block is one bad reply away from losing its slot again.
    pub fn allows(&self, provider: Provider) -> bool {
        self.allows_at(provider, Instant::now())
    }

    /// A good reply wipes the provider's slate.
    pub fn on_success(&self, provider: Provider) {
        self.lock().remove(&provider);
    }

    /// Record a failed request; `rate_limited` failures weigh double.
    pub fn on_failure(&self, provider: Provider, rate_limited: bool) {
        self.on_failure_at(provider, rate_limited, Instant::now());
    }

    fn allows_at(&self, provider: Provider, now: Instant) -> bool {
        let mut ledger = self.lock();
        let Some(health) = ledger.get_mut(&provider) else {
            return true;
        };
        health.settle(now);
        match health.blocked_until {
            Some(until) if now < until => false,
            Some(_) => {
                debug!(provider = %provider, "Exclusion window over, provider back in rotation");
                health.blocked_until = None;
                true
            }
            None => true,
        }
    }

    fn on_failure_at(&self, provider: Provider, rate_limited: bool, now: Instant) {
        let mut ledger = self.lock();
        let health = ledger.entry(provider).or_insert_with(|| Health::new(now));
        health.settle(now);
        health.penalty += if rate_limited {
            RATE_LIMIT_WEIGHT
        } else {
            ERROR_WEIGHT
        };
        if health.penalty >= TRIP_PENALTY && health.blocked_until.is_none() {
            let window = BLOCK_PER_PENALTY.mul_f64(health.penalty).min(BLOCK_CAP);
            health.blocked_until = Some(now + window);
            warn!(
                provider = %provider,
                penalty = health.penalty,
                window_secs = window.as_secs(),
                "Provider taken out of rotation"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Provider, Health>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

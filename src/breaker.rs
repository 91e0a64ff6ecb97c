//! Per-provider circuit breaker (spec §4.7): closed → open on a failure
//! run, open → half-open after a cooldown, half-open → closed on a probe
//! success or back to open on a probe failure.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU32, Ordering},
    sync::RwLock,
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::models::{BreakerState, ProviderHealth, ProviderKind};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: ChronoDuration,
    /// Cap on concurrent calls admitted while half-open (spec §4.5).
    pub max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: ChronoDuration::seconds(30),
            max_probes: 1,
        }
    }
}

#[derive(Debug)]
struct Breaker {
    config: BreakerConfig,
    state: RwLock<BreakerState>,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    in_flight_probes: AtomicU32,
    last_failure_at: RwLock<Option<DateTime<Utc>>>,
    last_success_at: RwLock<Option<DateTime<Utc>>>,
    opened_at: RwLock<Option<DateTime<Utc>>>,
}

impl Breaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(BreakerState::Closed),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            in_flight_probes: AtomicU32::new(0),
            last_failure_at: RwLock::new(None),
            last_success_at: RwLock::new(None),
            opened_at: RwLock::new(None),
        }
    }

    /// Applies the open-to-half-open cooldown transition, then returns
    /// the (possibly just-updated) state.
    fn settled_state(&self) -> BreakerState {
        let current = *self.state.read().unwrap();
        if current != BreakerState::Open {
            return current;
        }

        let opened_at = *self.opened_at.read().unwrap();
        let Some(opened_at) = opened_at else { return current };

        if Utc::now() - opened_at >= self.config.recovery_timeout {
            let mut state = self.state.write().unwrap();
            if *state == BreakerState::Open {
                *state = BreakerState::HalfOpen;
                self.success_count.store(0, Ordering::SeqCst);
            }
            *state
        } else {
            current
        }
    }

    fn allows_request(&self) -> bool {
        self.settled_state() != BreakerState::Open
    }

    /// Gates admission the same way `allows_request` does, but also caps
    /// concurrent half-open probes at `max_probes` (spec §4.5): once a
    /// provider trips back to half-open, only a bounded number of callers
    /// may race the recovery probe at once rather than every queued
    /// sender being let through the instant the cooldown elapses.
    fn try_admit(&self) -> bool {
        match self.settled_state() {
            BreakerState::Open => false,
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                let mut current = self.in_flight_probes.load(Ordering::SeqCst);
                loop {
                    if current >= self.config.max_probes {
                        return false;
                    }
                    match self.in_flight_probes.compare_exchange(
                        current,
                        current + 1,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    ) {
                        Ok(_) => return true,
                        Err(observed) => current = observed,
                    }
                }
            }
        }
    }

    fn release_probe(&self) {
        let _ = self.in_flight_probes.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }

    fn record_success(&self) {
        let now = Utc::now();
        *self.last_success_at.write().unwrap() = Some(now);

        match self.settled_state() {
            BreakerState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            BreakerState::HalfOpen => {
                self.release_probe();
                let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.success_threshold {
                    self.close();
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let now = Utc::now();
        *self.last_failure_at.write().unwrap() = Some(now);

        match self.settled_state() {
            BreakerState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.failure_threshold {
                    self.open(now);
                }
            }
            BreakerState::HalfOpen => {
                self.release_probe();
                self.open(now);
            }
            BreakerState::Open => {}
        }
    }

    fn open(&self, at: DateTime<Utc>) {
        *self.state.write().unwrap() = BreakerState::Open;
        *self.opened_at.write().unwrap() = Some(at);
        self.success_count.store(0, Ordering::SeqCst);
        self.in_flight_probes.store(0, Ordering::SeqCst);
    }

    fn close(&self) {
        *self.state.write().unwrap() = BreakerState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        self.in_flight_probes.store(0, Ordering::SeqCst);
        *self.opened_at.write().unwrap() = None;
    }

    fn next_probe_at(&self) -> Option<DateTime<Utc>> {
        let opened_at = (*self.opened_at.read().unwrap())?;
        Some(opened_at + self.config.recovery_timeout)
    }

    fn health(&self, provider: ProviderKind) -> ProviderHealth {
        ProviderHealth {
            provider,
            state: self.settled_state(),
            failure_count: self.failure_count.load(Ordering::SeqCst),
            success_count: self.success_count.load(Ordering::SeqCst),
            last_failure_at: *self.last_failure_at.read().unwrap(),
            last_success_at: *self.last_success_at.read().unwrap(),
            next_probe_at: self.next_probe_at(),
        }
    }
}

/// One breaker per provider kind. `execute` gates the call; the caller
/// is responsible for running its rate-limit reservation *before*
/// calling `execute` (spec §4.7 ordering: breaker check happens ahead of
/// quota reservation so a tripped provider never burns a workspace's
/// quota on a call that was never attempted).
pub struct BreakerRegistry {
    breakers: HashMap<ProviderKind, Breaker>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        let breakers = [ProviderKind::Gmail, ProviderKind::Mailgun, ProviderKind::Mandrill]
            .into_iter()
            .map(|kind| (kind, Breaker::new(config)))
            .collect();
        Self { breakers }
    }

    fn breaker(&self, provider: ProviderKind) -> &Breaker {
        self.breakers.get(&provider).expect("breaker registered for every ProviderKind variant")
    }

    pub fn allows_request(&self, provider: ProviderKind) -> bool {
        self.breaker(provider).allows_request()
    }

    /// Like `allows_request`, but for a half-open provider this also
    /// claims one of `max_probes` concurrent admission slots. Callers
    /// that are actually about to invoke the provider (not merely
    /// filtering candidates) should use this instead of `allows_request`,
    /// and must report the outcome via `record_success`/`record_failure`
    /// so the slot is released.
    pub fn try_admit(&self, provider: ProviderKind) -> bool {
        self.breaker(provider).try_admit()
    }

    pub fn next_probe_at(&self, provider: ProviderKind) -> Option<DateTime<Utc>> {
        self.breaker(provider).next_probe_at()
    }

    pub fn record_success(&self, provider: ProviderKind) {
        self.breaker(provider).record_success();
    }

    pub fn record_failure(&self, provider: ProviderKind) {
        self.breaker(provider).record_failure();
    }

    /// Runs `operation`, gated by the provider's breaker, and records
    /// the outcome. Returns `Err(None)` if the breaker was open and the
    /// operation never ran.
    pub async fn execute<F, Fut, T, E>(&self, provider: ProviderKind, operation: F) -> Result<T, Option<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.try_admit(provider) {
            return Err(None);
        }

        match operation().await {
            Ok(value) => {
                self.record_success(provider);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(provider);
                Err(Some(err))
            }
        }
    }

    pub fn snapshot(&self) -> Vec<ProviderHealth> {
        self.breakers.iter().map(|(kind, breaker)| breaker.health(*kind)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig { failure_threshold: 2, success_threshold: 1, recovery_timeout: ChronoDuration::seconds(-1), max_probes: 10 }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let registry = BreakerRegistry::new(config());

        let _: Result<(), Option<()>> = registry.execute(ProviderKind::Mailgun, || async { Err(()) }).await;
        assert!(registry.allows_request(ProviderKind::Mailgun));

        let _: Result<(), Option<()>> = registry.execute(ProviderKind::Mailgun, || async { Err(()) }).await;
        assert!(!registry.allows_request(ProviderKind::Mailgun));
    }

    #[tokio::test]
    async fn half_open_probe_success_closes() {
        let registry = BreakerRegistry::new(config());

        for _ in 0..2 {
            let _: Result<(), Option<()>> = registry.execute(ProviderKind::Gmail, || async { Err(()) }).await;
        }
        assert!(!registry.breaker(ProviderKind::Gmail).allows_request());

        // recovery_timeout is negative, so the very next check settles to half-open
        let result: Result<(), Option<()>> = registry.execute(ProviderKind::Gmail, || async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(registry.breaker(ProviderKind::Gmail).settled_state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let registry = BreakerRegistry::new(config());

        for _ in 0..2 {
            let _: Result<(), Option<()>> = registry.execute(ProviderKind::Mandrill, || async { Err(()) }).await;
        }

        let result: Result<(), Option<()>> = registry.execute(ProviderKind::Mandrill, || async { Err(()) }).await;
        assert!(result.is_err());
        assert_eq!(registry.breaker(ProviderKind::Mandrill).settled_state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_running_operation() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            recovery_timeout: ChronoDuration::seconds(3600),
            max_probes: 10,
        });

        let _: Result<(), Option<()>> = registry.execute(ProviderKind::Mailgun, || async { Err(()) }).await;

        let mut ran = false;
        let result: Result<(), Option<()>> = registry
            .execute(ProviderKind::Mailgun, || {
                ran = true;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(None)));
        assert!(!ran);
    }

    #[tokio::test]
    async fn half_open_caps_concurrent_probes() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 5,
            recovery_timeout: ChronoDuration::seconds(-1),
            max_probes: 2,
        });

        let _: Result<(), Option<()>> = registry.execute(ProviderKind::Gmail, || async { Err(()) }).await;
        assert_eq!(registry.breaker(ProviderKind::Gmail).settled_state(), BreakerState::HalfOpen);

        assert!(registry.try_admit(ProviderKind::Gmail));
        assert!(registry.try_admit(ProviderKind::Gmail));
        assert!(!registry.try_admit(ProviderKind::Gmail));

        registry.record_success(ProviderKind::Gmail);
        assert!(registry.try_admit(ProviderKind::Gmail));
    }
}

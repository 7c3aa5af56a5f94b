//! Tiered capacity pool with a circuit breaker for agent traffic.
//!
//! A fixed number of slots is split between interactive (human), agent and
//! system callers. Each tier is capped at its share. Interactive callers at
//! their cap are refused at once; agent and system callers wait a bounded time.
//! Agent acquisitions fail fast while total utilisation exceeds the high-water
//! mark.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::model::Tier;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("{tier} tier rejected: circuit open at {utilisation_pct}% utilisation")]
    CircuitOpen { tier: Tier, utilisation_pct: u32 },
    #[error("{tier} tier exhausted: no slot within {waited_ms}ms")]
    Timeout { tier: Tier, waited_ms: u64 },
    #[error("{tier} tier exhausted: all {cap} slots in use")]
    TierFull { tier: Tier, cap: usize },
    #[error("{tier} tier has no capacity configured")]
    NoCapacity { tier: Tier },
    #[error("pool is closed")]
    Closed,
    #[error("invalid pool config: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Label for metrics and wire errors.
    pub fn reason(&self) -> &'static str {
        match self {
            PoolError::CircuitOpen { .. } => "circuit_open",
            PoolError::Timeout { .. } => "timeout",
            PoolError::TierFull { .. } => "tier_full",
            PoolError::NoCapacity { .. } => "no_capacity",
            PoolError::Closed => "closed",
            PoolError::InvalidConfig(_) => "invalid_config",
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self,
            PoolError::CircuitOpen { .. } | PoolError::Timeout { .. } | PoolError::TierFull { .. }
        )
    }
}

/// Exponential backoff: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub size: usize,
    /// Percent shares for interactive / agent / system. Must sum to 100.
    pub shares: [u32; 3],
    pub high_water_pct: u32,
    pub acquire_timeout: Duration,
    pub backoff: Backoff,
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 20,
            shares: [60, 30, 10],
            high_water_pct: 90,
            acquire_timeout: Duration::from_secs(5),
            backoff: Backoff::default(),
            max_retries: 3,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.size == 0 {
            return Err(PoolError::InvalidConfig("size must be positive".into()));
        }
        if self.shares.iter().sum::<u32>() != 100 {
            return Err(PoolError::InvalidConfig(format!(
                "shares {:?} must sum to 100",
                self.shares
            )));
        }
        if self.high_water_pct == 0 || self.high_water_pct > 100 {
            return Err(PoolError::InvalidConfig("high-water mark must be 1..=100".into()));
        }
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::InvalidConfig("acquire timeout must be positive".into()));
        }
        if self.backoff.base > self.backoff.max {
            return Err(PoolError::InvalidConfig("backoff base exceeds max".into()));
        }
        Ok(())
    }

    /// Slots per tier. Agent and system shares round down; interactive gets the rest.
    pub fn caps(&self) -> [usize; 3] {
        let agent = self.size * self.shares[1] as usize / 100;
        let system = self.size * self.shares[2] as usize / 100;
        [self.size - agent - system, agent, system]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub tier: Tier,
    pub cap: usize,
    pub in_use: usize,
    pub waiting: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub in_use: usize,
    pub utilisation_pct: u32,
    pub breaker_open: bool,
    pub tiers: Vec<TierStats>,
}

struct TierSlot {
    tier: Tier,
    cap: usize,
    semaphore: Arc<Semaphore>,
    in_use: AtomicUsize,
    waiting: AtomicUsize,
}

struct PoolInner {
    config: PoolConfig,
    slots: [TierSlot; 3],
    in_use: AtomicUsize,
}

impl PoolInner {
    fn slot(&self, tier: Tier) -> &TierSlot {
        &self.slots[tier.index()]
    }

    fn utilisation_pct(&self) -> u32 {
        (self.in_use.load(Ordering::Acquire) * 100 / self.config.size) as u32
    }

    /// Open strictly above the mark, compared exactly rather than on the rounded percentage.
    fn breaker_open(&self) -> bool {
        self.in_use.load(Ordering::Acquire) * 100 > self.config.high_water_pct as usize * self.config.size
    }
}

pub struct PoolManager {
    inner: Arc<PoolInner>,
}

/// A held slot. Released when dropped, on every path.
pub struct PoolHandle {
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
    tier: Tier,
    /// Tier whose slot is held; differs from `tier` when the system tier borrowed.
    lent_from: Tier,
    caller: String,
    acquired_at: Instant,
}

impl PoolHandle {
    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn borrowed(&self) -> bool {
        self.tier != self.lent_from
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("tier", &self.tier)
            .field("lent_from", &self.lent_from)
            .field("caller", &self.caller)
            .finish()
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        self.inner.slot(self.lent_from).in_use.fetch_sub(1, Ordering::AcqRel);
        self.inner.in_use.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!(crate::observability::POOL_IN_USE, "tier" => self.lent_from.as_str())
            .decrement(1.0);
        tracing::trace!(
            caller = %self.caller,
            tier = %self.tier,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "pool slot released"
        );
    }
}

/// Decrements the waiter count however the wait ends (success, timeout, cancel).
struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let caps = config.caps();
        let slot = |tier: Tier| TierSlot {
            tier,
            cap: caps[tier.index()],
            semaphore: Arc::new(Semaphore::new(caps[tier.index()])),
            in_use: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        };
        let slots = [slot(Tier::Interactive), slot(Tier::Agent), slot(Tier::System)];
        tracing::info!(
            "pool: {} slots (interactive {}, agent {}, system {}), breaker at {}%",
            config.size,
            caps[0],
            caps[1],
            caps[2],
            config.high_water_pct
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                slots,
                in_use: AtomicUsize::new(0),
            }),
        })
    }

    /// Acquire one slot for `tier`. A full interactive tier fails immediately;
    /// other tiers wait at most the configured timeout.
    pub async fn acquire(&self, tier: Tier, caller: &str) -> Result<PoolHandle, PoolError> {
        let inner = &self.inner;
        let slot = inner.slot(tier);

        if tier == Tier::Agent && inner.breaker_open() {
            let utilisation_pct = inner.utilisation_pct();
            metrics::counter!(crate::observability::POOL_BREAKER_TRIPS_TOTAL).increment(1);
            tracing::warn!(%caller, utilisation_pct, "pool circuit open, rejecting agent");
            return Err(self.reject(PoolError::CircuitOpen { tier, utilisation_pct }));
        }

        if let Ok(permit) = slot.semaphore.clone().try_acquire_owned() {
            return Ok(self.handle(permit, tier, tier, caller));
        }

        if tier == Tier::System {
            let lender = inner.slot(Tier::Interactive);
            if let Ok(permit) = lender.semaphore.clone().try_acquire_owned() {
                tracing::debug!(%caller, "system tier borrowed an interactive slot");
                return Ok(self.handle(permit, tier, Tier::Interactive, caller));
            }
        }

        if slot.cap == 0 {
            return Err(self.reject(PoolError::NoCapacity { tier }));
        }
        if tier == Tier::Interactive {
            tracing::warn!(%caller, cap = slot.cap, "interactive tier full, rejecting");
            return Err(self.reject(PoolError::TierFull { tier, cap: slot.cap }));
        }

        slot.waiting.fetch_add(1, Ordering::AcqRel);
        let _waiting = WaitGuard(&slot.waiting);
        let timeout = inner.config.acquire_timeout;
        match tokio::time::timeout(timeout, slot.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(self.handle(permit, tier, tier, caller)),
            Ok(Err(_)) => Err(self.reject(PoolError::Closed)),
            Err(_) => Err(self.reject(PoolError::Timeout {
                tier,
                waited_ms: timeout.as_millis() as u64,
            })),
        }
    }

    /// `acquire` with exponential backoff between retryable rejections.
    pub async fn acquire_with_backoff(
        &self,
        tier: Tier,
        caller: &str,
    ) -> Result<PoolHandle, PoolError> {
        let mut attempt = 0;
        loop {
            match self.acquire(tier, caller).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.retryable() && attempt < self.inner.config.max_retries => {
                    let delay = self.inner.config.backoff.delay(attempt);
                    tracing::debug!(%caller, attempt, ?delay, "pool rejected ({}), backing off", e.reason());
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            size: inner.config.size,
            in_use: inner.in_use.load(Ordering::Acquire),
            utilisation_pct: inner.utilisation_pct(),
            breaker_open: inner.breaker_open(),
            tiers: inner
                .slots
                .iter()
                .map(|s| TierStats {
                    tier: s.tier,
                    cap: s.cap,
                    in_use: s.in_use.load(Ordering::Acquire),
                    waiting: s.waiting.load(Ordering::Acquire),
                })
                .collect(),
        }
    }

    fn handle(&self, permit: OwnedSemaphorePermit, tier: Tier, lent_from: Tier, caller: &str) -> PoolHandle {
        self.inner.slot(lent_from).in_use.fetch_add(1, Ordering::AcqRel);
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!(crate::observability::POOL_IN_USE, "tier" => lent_from.as_str()).increment(1.0);
        PoolHandle {
            inner: self.inner.clone(),
            _permit: permit,
            tier,
            lent_from,
            caller: caller.to_string(),
            acquired_at: Instant::now(),
        }
    }

    fn reject(&self, err: PoolError) -> PoolError {
        let tier = match &err {
            PoolError::CircuitOpen { tier, .. }
            | PoolError::Timeout { tier, .. }
            | PoolError::TierFull { tier, .. }
            | PoolError::NoCapacity { tier } => tier.as_str(),
            _ => "none",
        };
        metrics::counter!(
            crate::observability::POOL_REJECTIONS_TOTAL,
            "tier" => tier,
            "reason" => err.reason()
        )
        .increment(1);
        err
    }
}

//! Concurrency control for stage workers
//!
//! Two mechanisms bound parallelism:
//! - per-stage consumer counts, applied within one worker process;
//! - dependency locks in the control plane, which serialize calls to a
//!   rate-limited provider across all processes.

use crate::control_plane::{ControlPlane, LockLease};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use waypoint_core::Stage;

/// Consumers per stage for stages that call no rate-limited dependency
pub const DEFAULT_UNLIMITED_STAGE_CONCURRENCY: usize = 4;

/// Consumers on the orchestration queue
pub const DEFAULT_ORCHESTRATION_CONCURRENCY: usize = 8;

/// How many consumers each queue gets in this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyConfig {
    overrides: BTreeMap<Stage, usize>,
    pub orchestration: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            overrides: BTreeMap::new(),
            orchestration: DEFAULT_ORCHESTRATION_CONCURRENCY,
        }
    }
}

impl ConcurrencyConfig {
    /// Parse overrides of the form `map=8,reviews=0`.
    ///
    /// Stages calling a rate-limited dependency accept only 0 or 1; zero
    /// leaves the stage to other worker processes.
    pub fn parse_overrides(raw: &str) -> crate::Result<BTreeMap<Stage, usize>> {
        let mut overrides = BTreeMap::new();

        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                crate::Error::Validation(format!("expected stage=count, got '{}'", pair))
            })?;
            let stage: Stage = name
                .trim()
                .parse()
                .map_err(|e: waypoint_core::Error| crate::Error::Validation(e.to_string()))?;
            let count: usize = value.trim().parse().map_err(|_| {
                crate::Error::Validation(format!("invalid consumer count for {}: '{}'", stage, value))
            })?;

            if stage.descriptor().is_rate_limited() && count > 1 {
                return Err(crate::Error::Validation(format!(
                    "{} calls a rate-limited dependency and cannot run {} consumers",
                    stage, count
                )));
            }
            overrides.insert(stage, count);
        }

        Ok(overrides)
    }

    pub fn with_overrides(mut self, overrides: BTreeMap<Stage, usize>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_orchestration(mut self, consumers: usize) -> Self {
        self.orchestration = consumers;
        self
    }

    /// Consumers for a stage queue
    pub fn for_stage(&self, stage: Stage) -> usize {
        self.overrides.get(&stage).copied().unwrap_or_else(|| {
            if stage.descriptor().is_rate_limited() {
                1
            } else {
                DEFAULT_UNLIMITED_STAGE_CONCURRENCY
            }
        })
    }
}

/// Bounded-wait access to dependency locks
#[derive(Clone)]
pub struct DependencyGate {
    control: Arc<dyn ControlPlane>,
    ttl: Duration,
    max_wait: Duration,
    poll_interval: Duration,
}

impl DependencyGate {
    pub fn new(control: Arc<dyn ControlPlane>, ttl: Duration, max_wait: Duration) -> Self {
        Self {
            control,
            ttl,
            max_wait,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Take the named lock, waiting at most `max_wait`.
    ///
    /// Returns `None` when the wait ran out.
    #[tracing::instrument(
        name = "dependency.acquire",
        skip(self),
        fields(
            ttl_ms = self.ttl.as_millis() as u64,
            acquired = tracing::field::Empty,
            wait_duration_ms = tracing::field::Empty,
        )
    )]
    pub async fn acquire(&self, name: &str) -> crate::Result<Option<LockLease>> {
        let span = tracing::Span::current();
        let start = Instant::now();

        let lease = loop {
            if let Some(lease) = self.control.acquire_lock(name, self.ttl).await? {
                break Some(lease);
            }
            if start.elapsed() >= self.max_wait {
                break None;
            }
            tokio::time::sleep(self.poll_interval).await;
        };

        span.record("acquired", lease.is_some());
        span.record("wait_duration_ms", start.elapsed().as_millis() as u64);
        Ok(lease)
    }

    /// Drive `work` to completion while keeping `lease` alive.
    ///
    /// The lease is renewed every third of its TTL, so its TTL bounds how
    /// long a crashed holder can block the dependency, not how long a stage
    /// may take.
    pub async fn hold<F: Future>(&self, lease: &LockLease, work: F) -> F::Output {
        tokio::pin!(work);
        let period = (self.ttl / 3).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => match self.control.renew_lock(lease, self.ttl).await {
                    Ok(true) => {}
                    Ok(false) => warn!(lock = %lease.name, "Dependency lock lost while held"),
                    Err(e) => warn!(lock = %lease.name, error = %e, "Failed to renew dependency lock"),
                },
            }
        }
    }

    /// Release a lease; a lease that expired in the meantime is only logged
    pub async fn release(&self, lease: &LockLease) {
        match self.control.release_lock(lease).await {
            Ok(true) => {}
            Ok(false) => warn!(lock = %lease.name, "Dependency lock expired before release"),
            Err(e) => warn!(lock = %lease.name, error = %e, "Failed to release dependency lock"),
        }
    }
}

//! In-process control plane

use super::{ControlPlane, DispatchUnit, HardStopReport, LockLease};
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<DispatchUnit>>,
    locks: HashMap<String, (String, Instant)>,
}

/// Control plane that lives inside one process.
///
/// Used by tests and single-process deployments. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryControlPlane {
    state: Arc<Mutex<State>>,
    epoch: Arc<AtomicU64>,
    notify: Arc<Notify>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| crate::Error::ControlPlane("control plane state poisoned".to_string()))
    }

    fn try_pop(&self, queue: &str) -> Result<Option<DispatchUnit>> {
        Ok(self
            .lock_state()?
            .queues
            .get_mut(queue)
            .and_then(VecDeque::pop_front))
    }

    /// Snapshot of a queue's contents, head first
    pub fn peek(&self, queue: &str) -> Vec<DispatchUnit> {
        self.lock_state()
            .map(|state| {
                state
                    .queues
                    .get(queue)
                    .map(|q| q.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn enqueue(&self, unit: DispatchUnit) -> Result<()> {
        let queue = unit.queue();
        self.lock_state()?
            .queues
            .entry(queue)
            .or_default()
            .push_back(unit);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<DispatchUnit>> {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so a concurrent enqueue is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(unit) = self.try_pop(queue)? {
                return Ok(Some(unit));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        Ok(self
            .lock_state()?
            .queues
            .get(queue)
            .map_or(0, |q| q.len() as u64))
    }

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<Option<LockLease>> {
        let mut state = self.lock_state()?;
        let now = Instant::now();

        if let Some((_, expires_at)) = state.locks.get(name) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let lease = LockLease::new(name);
        state
            .locks
            .insert(name.to_string(), (lease.token.clone(), now + ttl));
        Ok(Some(lease))
    }

    async fn renew_lock(&self, lease: &LockLease, ttl: Duration) -> Result<bool> {
        let mut state = self.lock_state()?;
        let now = Instant::now();
        match state.locks.get_mut(&lease.name) {
            Some((token, expires_at)) if *token == lease.token && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, lease: &LockLease) -> Result<bool> {
        let mut state = self.lock_state()?;
        let held = matches!(
            state.locks.get(&lease.name),
            Some((token, expires_at)) if *token == lease.token && *expires_at > Instant::now()
        );
        if held {
            state.locks.remove(&lease.name);
        }
        Ok(held)
    }

    async fn epoch(&self) -> Result<u64> {
        Ok(self.epoch.load(Ordering::SeqCst))
    }

    async fn hard_stop(&self) -> Result<HardStopReport> {
        let report = {
            let mut state = self.lock_state()?;
            let units_discarded = state.queues.values().map(|q| q.len() as u64).sum();
            let locks_cleared = state.locks.len() as u64;
            state.queues.clear();
            state.locks.clear();
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

            HardStopReport {
                units_discarded,
                locks_cleared,
                epoch,
            }
        };
        self.notify.notify_waiters();
        Ok(report)
    }
}

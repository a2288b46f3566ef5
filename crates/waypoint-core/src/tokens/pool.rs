//! Capacity-bounded CPU / disk token pools

use crate::config::TokenConfig;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// Token request priority. Lower values are more urgent.
pub type Priority = u32;

/// Priority of requests that must never be frozen out
pub const HIGHEST_PRIORITY: Priority = 0;

/// Kind of work a token permits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Processing one chunk / stage on a CPU worker
    Cpu,
    /// One outstanding disk operation
    Disk,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Cpu => f.write_str("cpu"),
            TokenKind::Disk => f.write_str("disk"),
        }
    }
}

/// Snapshot of a pool's counters.
///
/// `issued - released == outstanding <= capacity` holds for every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenStats {
    /// Configured capacity
    pub capacity: usize,
    /// Tokens currently held by callers
    pub outstanding: usize,
    /// Tokens handed out since creation
    pub issued: u64,
    /// Tokens returned since creation
    pub released: u64,
    /// Callers blocked in `acquire`
    pub waiting: usize,
}

struct PoolState {
    free: Vec<u32>,
    waiting: usize,
    cutoff: Priority,
    issued: u64,
    released: u64,
}

struct Pool {
    kind: TokenKind,
    cleaner: bool,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl Pool {
    fn new(kind: TokenKind, cleaner: bool, capacity: usize, label_base: u32) -> Arc<Self> {
        let free = (0..capacity as u32).rev().map(|i| label_base + i).collect();
        Arc::new(Self {
            kind,
            cleaner,
            capacity,
            state: Mutex::new(PoolState {
                free,
                waiting: 0,
                cutoff: Priority::MAX,
                issued: 0,
                released: 0,
            }),
            available: Condvar::new(),
        })
    }

    fn acquire(self: &Arc<Self>, priority: Priority) -> Result<WorkToken> {
        if self.capacity == 0 {
            return Err(Error::token(format!(
                "{} pool{} has no capacity",
                self.kind,
                if self.cleaner { " (cleaner)" } else { "" }
            )));
        }
        let mut state = self.state.lock();
        state.waiting += 1;
        while state.free.is_empty() || priority > state.cutoff {
            self.available.wait(&mut state);
        }
        state.waiting -= 1;
        Ok(self.grant(&mut state))
    }

    fn try_acquire(self: &Arc<Self>, priority: Priority) -> Option<WorkToken> {
        let mut state = self.state.lock();
        // blocked requesters are served first
        if state.free.len() > state.waiting && priority <= state.cutoff {
            Some(self.grant(&mut state))
        } else {
            None
        }
    }

    fn grant(self: &Arc<Self>, state: &mut PoolState) -> WorkToken {
        let label = state.free.pop().unwrap_or_default();
        state.issued += 1;
        WorkToken {
            pool: Arc::clone(self),
            label,
        }
    }

    fn give_back(&self, label: u32) {
        let mut state = self.state.lock();
        state.free.push(label);
        state.released += 1;
        drop(state);
        // waiters may be frozen out by priority, so wake them all
        self.available.notify_all();
    }

    fn set_cutoff(&self, cutoff: Priority) {
        self.state.lock().cutoff = cutoff;
        self.available.notify_all();
    }

    fn stats(&self) -> TokenStats {
        let state = self.state.lock();
        TokenStats {
            capacity: self.capacity,
            outstanding: self.capacity - state.free.len(),
            issued: state.issued,
            released: state.released,
            waiting: state.waiting,
        }
    }
}

/// A work permit. Returned to its pool exactly once, when dropped.
pub struct WorkToken {
    pool: Arc<Pool>,
    label: u32,
}

impl WorkToken {
    /// Kind of work permitted
    pub fn kind(&self) -> TokenKind {
        self.pool.kind
    }

    /// Diagnostic label (CPU tokens 100+, disk 200+, cleaner 300+/400+)
    pub fn label(&self) -> u32 {
        self.label
    }

    /// True for tokens drawn from the cleaner reserve
    pub fn is_cleaner(&self) -> bool {
        self.pool.cleaner
    }

    /// Return the token to its pool
    pub fn release(self) {}
}

impl Drop for WorkToken {
    fn drop(&mut self) {
        self.pool.give_back(self.label);
    }
}

impl fmt::Debug for WorkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkToken")
            .field("kind", &self.pool.kind)
            .field("label", &self.label)
            .field("cleaner", &self.pool.cleaner)
            .finish()
    }
}

/// CPU and disk token pools plus the cleaner's reserved budget
#[derive(Clone)]
pub struct TokenPool {
    cpu: Arc<Pool>,
    disk: Arc<Pool>,
    cleaner_cpu: Arc<Pool>,
    cleaner_disk: Arc<Pool>,
}

impl TokenPool {
    /// Create pools sized by `config`
    pub fn new(config: &TokenConfig) -> Result<Self> {
        if config.cpu_tokens == 0 || config.disk_tokens == 0 {
            return Err(Error::config("token pools need at least one CPU and one disk token"));
        }
        tracing::debug!(
            cpu = config.cpu_tokens,
            disk = config.disk_tokens,
            cleaner_cpu = config.cleaner_cpu_tokens,
            cleaner_disk = config.cleaner_disk_tokens,
            "creating token pools"
        );
        Ok(Self {
            cpu: Pool::new(TokenKind::Cpu, false, config.cpu_tokens, 100),
            disk: Pool::new(TokenKind::Disk, false, config.disk_tokens, 200),
            cleaner_cpu: Pool::new(TokenKind::Cpu, true, config.cleaner_cpu_tokens, 300),
            cleaner_disk: Pool::new(TokenKind::Disk, true, config.cleaner_disk_tokens, 400),
        })
    }

    fn pool(&self, kind: TokenKind) -> &Arc<Pool> {
        match kind {
            TokenKind::Cpu => &self.cpu,
            TokenKind::Disk => &self.disk,
        }
    }

    fn cleaner_pool(&self, kind: TokenKind) -> &Arc<Pool> {
        match kind {
            TokenKind::Cpu => &self.cleaner_cpu,
            TokenKind::Disk => &self.cleaner_disk,
        }
    }

    /// Block until a token of `kind` is available to `priority`
    pub fn acquire(&self, kind: TokenKind, priority: Priority) -> Result<WorkToken> {
        self.pool(kind).acquire(priority)
    }

    /// Grant a token only if one is free beyond those owed to blocked callers
    pub fn try_acquire(&self, kind: TokenKind, priority: Priority) -> Option<WorkToken> {
        self.pool(kind).try_acquire(priority)
    }

    /// Block on the cleaner's reserved budget
    pub fn acquire_cleaner(&self, kind: TokenKind) -> Result<WorkToken> {
        self.cleaner_pool(kind).acquire(HIGHEST_PRIORITY)
    }

    /// Non-blocking grab from the cleaner's reserved budget
    pub fn try_acquire_cleaner(&self, kind: TokenKind) -> Option<WorkToken> {
        self.cleaner_pool(kind).try_acquire(HIGHEST_PRIORITY)
    }

    /// Return a token
    pub fn release(&self, token: WorkToken) {
        drop(token);
    }

    /// Only requests with `priority <= cutoff` are admitted; raising the
    /// cutoff re-admits frozen-out requests.
    pub fn set_priority_cutoff(&self, kind: TokenKind, cutoff: Priority) {
        tracing::debug!("{} priority cutoff set to {}", kind, cutoff);
        self.pool(kind).set_cutoff(cutoff);
    }

    /// Counters of the regular pool
    pub fn stats(&self, kind: TokenKind) -> TokenStats {
        self.pool(kind).stats()
    }

    /// Counters of the cleaner reserve
    pub fn cleaner_stats(&self, kind: TokenKind) -> TokenStats {
        self.cleaner_pool(kind).stats()
    }
}

impl fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPool")
            .field("cpu", &self.stats(TokenKind::Cpu))
            .field("disk", &self.stats(TokenKind::Disk))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn pool(cpu: usize, disk: usize) -> TokenPool {
        TokenPool::new(&TokenConfig {
            cpu_tokens: cpu,
            disk_tokens: disk,
            cleaner_cpu_tokens: 1,
            cleaner_disk_tokens: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_labels_and_kinds() {
        let tokens = pool(2, 1);
        let a = tokens.acquire(TokenKind::Cpu, 0).unwrap();
        let d = tokens.acquire(TokenKind::Disk, 0).unwrap();
        let c = tokens.acquire_cleaner(TokenKind::Disk).unwrap();
        assert_eq!(a.kind(), TokenKind::Cpu);
        assert!((100..102).contains(&a.label()));
        assert_eq!(d.label(), 200);
        assert_eq!(c.label(), 400);
        assert!(c.is_cleaner());
    }

    #[test]
    fn test_drop_returns_token() {
        let tokens = pool(1, 1);
        let t = tokens.try_acquire(TokenKind::Cpu, 0).unwrap();
        assert!(tokens.try_acquire(TokenKind::Cpu, 0).is_none());
        tokens.release(t);
        let stats = tokens.stats(TokenKind::Cpu);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.issued, 1);
        assert_eq!(stats.released, 1);
        assert!(tokens.try_acquire(TokenKind::Cpu, 0).is_some());
    }

    #[test]
    fn test_cleaner_reserve_is_independent() {
        let tokens = pool(1, 1);
        let _reader = tokens.acquire(TokenKind::Disk, 0).unwrap();
        assert!(tokens.try_acquire(TokenKind::Disk, 0).is_none());
        // write-back is not starved by read demand
        assert!(tokens.try_acquire_cleaner(TokenKind::Disk).is_some());
    }

    #[test]
    fn test_priority_cutoff_freezes_and_readmits() {
        let tokens = pool(2, 1);
        tokens.set_priority_cutoff(TokenKind::Cpu, 1);
        assert!(tokens.try_acquire(TokenKind::Cpu, 5).is_none());
        assert!(tokens.try_acquire(TokenKind::Cpu, 1).is_some());

        let waiter = {
            let tokens = tokens.clone();
            thread::spawn(move || tokens.acquire(TokenKind::Cpu, 5).unwrap().label())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        tokens.set_priority_cutoff(TokenKind::Cpu, 10);
        let label = waiter.join().unwrap();
        assert!((100..102).contains(&label));
    }

    #[test]
    fn test_try_acquire_defers_to_blocked_waiters() {
        let tokens = pool(1, 1);
        let held = tokens.acquire(TokenKind::Cpu, 0).unwrap();
        let waiter = {
            let tokens = tokens.clone();
            thread::spawn(move || {
                let _t = tokens.acquire(TokenKind::Cpu, 0).unwrap();
            })
        };
        while tokens.stats(TokenKind::Cpu).waiting == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(held);
        waiter.join().unwrap();
        assert_eq!(tokens.stats(TokenKind::Cpu).outstanding, 0);
    }

    #[test]
    fn test_zero_capacity_cleaner_pool_errors() {
        let tokens = TokenPool::new(&TokenConfig {
            cpu_tokens: 1,
            disk_tokens: 1,
            cleaner_cpu_tokens: 0,
            cleaner_disk_tokens: 0,
        })
        .unwrap();
        assert!(tokens.acquire_cleaner(TokenKind::Cpu).is_err());
        assert!(tokens.try_acquire_cleaner(TokenKind::Cpu).is_none());
    }

    #[test]
    fn test_concurrent_outstanding_never_exceeds_capacity() {
        let tokens = pool(3, 1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tokens = tokens.clone();
                let active = active.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let token = tokens.acquire(TokenKind::Cpu, 0).unwrap();
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        active.fetch_sub(1, Ordering::SeqCst);
                        drop(token);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = tokens.stats(TokenKind::Cpu);
        assert_eq!(stats.issued, 400);
        assert_eq!(stats.released, 400);
        assert_eq!(stats.outstanding, 0);
    }
}

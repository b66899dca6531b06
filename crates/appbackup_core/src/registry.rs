//! Token-addressed registry of in-flight asynchronous operations.
//!
//! Every agent round-trip, every blocking handshake and every running pass
//! registers an [`Operation`] under a fresh token. Whichever of completion,
//! timeout or cancellation reaches a pending operation first decides its
//! terminal state; anything arriving later is logged and dropped. Only the
//! owner removes an operation, after it has observed the terminal state.
//!
//! The table, the timer queue and both condition variables share one mutex.
//! Callbacks are always invoked after that mutex is released.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Longest the timer thread sleeps before re-checking that the registry
/// still exists.
const TIMER_IDLE: Duration = Duration::from_millis(250);

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Waiting for completion, timeout or cancellation.
    Pending,
    /// Completed by its agent.
    Acknowledged,
    /// Timed out or cancelled.
    TimedOut,
}

/// What an operation stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// An agent round-trip during backup, or a blocking handshake.
    BackupWait,
    /// An agent round-trip during restore.
    RestoreWait,
    /// A whole backup pass, registered so it can be cancelled.
    BackupTask,
}

/// Receives the outcome of an operation.
///
/// Implementations are called from whichever thread reconciled the
/// operation and should hand the event to their owner rather than act on
/// it in place.
pub trait OperationCallback: Send + Sync {
    /// The operation was completed with `result`.
    fn operation_complete(&self, token: u32, result: i64);

    /// The operation timed out or was cancelled.
    fn handle_cancel(&self, token: u32, cancel_all: bool);
}

/// A registered operation.
#[derive(Clone)]
pub struct Operation {
    /// Current state.
    pub state: OperationState,
    /// What the operation stands for.
    pub kind: OperationKind,
    /// Result passed to [`OperationRegistry::complete`].
    pub result: Option<i64>,
    callback: Option<Weak<dyn OperationCallback>>,
    timer_serial: Option<u64>,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("result", &self.result)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Deadline {
    at: Instant,
    serial: u64,
    token: u32,
}

#[derive(Default)]
struct Table {
    operations: HashMap<u32, Operation>,
    counter: u32,
    timers: BinaryHeap<Reverse<Deadline>>,
    next_serial: u64,
    timer_running: bool,
}

struct Inner {
    table: Mutex<Table>,
    /// Signalled on every state transition.
    changed: Condvar,
    /// Signalled when a timeout is armed.
    timer_wakeup: Condvar,
}

/// Shared handle to the operation registry.
#[derive(Clone)]
pub struct OperationRegistry {
    inner: Arc<Inner>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.len())
            .finish()
    }
}

impl OperationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(Table::default()),
                changed: Condvar::new(),
                timer_wakeup: Condvar::new(),
            }),
        }
    }

    /// Generates a token that is not currently registered.
    ///
    /// The high 24 bits are random and the low 8 bits come from a
    /// per-registry counter.
    pub fn generate_token(&self) -> u32 {
        let mut table = self.inner.table.lock();
        loop {
            table.counter = table.counter.wrapping_add(1);
            let token = (rand::random::<u32>() & 0xFFFF_FF00) | (table.counter & 0xFF);
            if token != 0 && !table.operations.contains_key(&token) {
                return token;
            }
        }
    }

    /// Registers a pending operation.
    ///
    /// A token that is still registered is rejected; its existing
    /// operation is left untouched.
    pub fn register(
        &self,
        token: u32,
        kind: OperationKind,
        callback: Option<Weak<dyn OperationCallback>>,
    ) -> CoreResult<()> {
        let mut table = self.inner.table.lock();
        if table.operations.contains_key(&token) {
            tracing::warn!(token, ?kind, "duplicate operation registration rejected");
            return Err(CoreError::DuplicateToken { token });
        }
        table.operations.insert(
            token,
            Operation {
                state: OperationState::Pending,
                kind,
                result: None,
                callback,
                timer_serial: None,
            },
        );
        tracing::trace!(token, ?kind, "operation registered");
        self.inner.changed.notify_all();
        Ok(())
    }

    /// Registers an operation and arms its timeout in one step.
    pub fn prepare(
        &self,
        token: u32,
        kind: OperationKind,
        timeout: Duration,
        callback: Option<Weak<dyn OperationCallback>>,
    ) -> CoreResult<()> {
        self.register(token, kind, callback)?;
        if let Err(e) = self.arm_timeout(token, timeout) {
            self.remove(token);
            return Err(e);
        }
        Ok(())
    }

    /// Schedules a timeout for a registered operation.
    ///
    /// If the operation is still pending when the deadline passes it is
    /// cancelled exactly as by [`cancel`](Self::cancel) with
    /// `cancel_all == false`. Re-arming replaces the previous deadline.
    pub fn arm_timeout(&self, token: u32, timeout: Duration) -> CoreResult<()> {
        let mut table = self.inner.table.lock();
        let serial = table.next_serial;
        table.next_serial += 1;
        let Some(op) = table.operations.get_mut(&token) else {
            return Err(CoreError::invalid_state(format!(
                "cannot arm timeout for unknown token {token:#010x}"
            )));
        };
        op.timer_serial = Some(serial);
        table.timers.push(Reverse(Deadline {
            at: Instant::now() + timeout,
            serial,
            token,
        }));
        if !table.timer_running {
            self.spawn_timer()?;
            table.timer_running = true;
        }
        self.inner.timer_wakeup.notify_one();
        Ok(())
    }

    /// Completes an operation.
    ///
    /// Unknown tokens and operations that already reached a terminal state
    /// are ignored.
    pub fn complete(&self, token: u32, result: i64) {
        let callback = {
            let mut table = self.inner.table.lock();
            let Some(op) = table.operations.get_mut(&token) else {
                tracing::debug!(token, "completion for unknown token dropped");
                return;
            };
            if op.state != OperationState::Pending {
                tracing::debug!(token, state = ?op.state, "late completion dropped");
                return;
            }
            op.state = OperationState::Acknowledged;
            op.result = Some(result);
            let callback = op.callback.clone();
            self.inner.changed.notify_all();
            callback
        };
        tracing::trace!(token, result, "operation acknowledged");
        if let Some(callback) = callback.and_then(|w| w.upgrade()) {
            callback.operation_complete(token, result);
        }
    }

    /// Cancels an operation.
    ///
    /// Unknown tokens and operations that already reached a terminal state
    /// are ignored.
    pub fn cancel(&self, token: u32, cancel_all: bool) {
        let callback = {
            let mut table = self.inner.table.lock();
            let Some(op) = table.operations.get_mut(&token) else {
                tracing::debug!(token, "cancel for unknown token dropped");
                return;
            };
            if op.state != OperationState::Pending {
                tracing::debug!(token, state = ?op.state, "late cancel dropped");
                return;
            }
            op.state = OperationState::TimedOut;
            let callback = op.callback.clone();
            self.inner.changed.notify_all();
            callback
        };
        tracing::debug!(token, cancel_all, "operation cancelled");
        if let Some(callback) = callback.and_then(|w| w.upgrade()) {
            callback.handle_cancel(token, cancel_all);
        }
    }

    /// Cancels every pending operation of `kind`. Returns how many were
    /// cancelled.
    pub fn cancel_all_of_kind(&self, kind: OperationKind, cancel_all: bool) -> usize {
        let tokens: Vec<u32> = {
            let table = self.inner.table.lock();
            table
                .operations
                .iter()
                .filter(|(_, op)| op.kind == kind && op.state == OperationState::Pending)
                .map(|(token, _)| *token)
                .collect()
        };
        for token in &tokens {
            self.cancel(*token, cancel_all);
        }
        tokens.len()
    }

    /// Parks the calling thread until the operation is terminal, then
    /// removes it.
    ///
    /// Returns true if it was acknowledged, false if it timed out, was
    /// cancelled, or is not registered.
    pub fn block_until_complete(&self, token: u32) -> bool {
        self.await_result(token).is_some()
    }

    /// Like [`block_until_complete`](Self::block_until_complete) but
    /// returns the completion result.
    pub fn await_result(&self, token: u32) -> Option<i64> {
        let mut table = self.inner.table.lock();
        loop {
            let state = table.operations.get(&token).map(|op| op.state)?;
            if state == OperationState::Pending {
                self.inner.changed.wait(&mut table);
                continue;
            }
            let op = table.operations.remove(&token)?;
            return match op.state {
                OperationState::Acknowledged => Some(op.result.unwrap_or_default()),
                _ => None,
            };
        }
    }

    /// Removes an operation. Its timeout, if any, becomes inert.
    pub fn remove(&self, token: u32) -> Option<Operation> {
        let mut table = self.inner.table.lock();
        let op = table.operations.remove(&token);
        if op.is_some() {
            self.inner.changed.notify_all();
        }
        op
    }

    /// Returns the state of an operation.
    #[must_use]
    pub fn state(&self, token: u32) -> Option<OperationState> {
        self.inner
            .table
            .lock()
            .operations
            .get(&token)
            .map(|op| op.state)
    }

    /// Number of registered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.table.lock().operations.len()
    }

    /// Returns true if no operation is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_timer(&self) -> CoreResult<()> {
        let weak = Arc::downgrade(&self.inner);
        thread::Builder::new()
            .name("appbackup-timeouts".into())
            .spawn(move || run_timer(weak))?;
        Ok(())
    }
}

/// Fires expired deadlines until the registry is dropped.
fn run_timer(weak: Weak<Inner>) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let expired = {
            let mut table = inner.table.lock();
            let now = Instant::now();
            let mut expired = Vec::new();
            while let Some(Reverse(deadline)) = table.timers.peek().copied() {
                if deadline.at > now {
                    break;
                }
                table.timers.pop();
                let live = table
                    .operations
                    .get(&deadline.token)
                    .is_some_and(|op| {
                        op.state == OperationState::Pending && op.timer_serial == Some(deadline.serial)
                    });
                if live {
                    expired.push(deadline.token);
                }
            }
            if expired.is_empty() {
                let wait = table
                    .timers
                    .peek()
                    .map_or(TIMER_IDLE, |&Reverse(d)| d.at.saturating_duration_since(now))
                    .min(TIMER_IDLE);
                inner.timer_wakeup.wait_for(&mut table, wait);
            }
            expired
        };
        if expired.is_empty() {
            continue;
        }
        let registry = OperationRegistry { inner };
        for token in expired {
            tracing::warn!(token, "operation timed out");
            registry.cancel(token, false);
        }
    }
}

/// Handle an agent uses to report the outcome of one call.
#[derive(Clone, Debug)]
pub struct Completion {
    token: u32,
    registry: OperationRegistry,
}

impl Completion {
    /// Creates a handle for `token`.
    #[must_use]
    pub fn new(token: u32, registry: OperationRegistry) -> Self {
        Self { token, registry }
    }

    /// The token this handle answers for.
    #[must_use]
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Reports completion.
    pub fn complete(&self, result: i64) {
        self.registry.complete(self.token, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[derive(Default)]
    struct Counter {
        completes: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl OperationCallback for Counter {
        fn operation_complete(&self, _token: u32, _result: i64) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_cancel(&self, _token: u32, _cancel_all: bool) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn callback(counter: &Arc<Counter>) -> Option<Weak<dyn OperationCallback>> {
        let strong: Arc<dyn OperationCallback> = counter.clone();
        Some(Arc::downgrade(&strong))
    }

    #[test]
    fn tokens_are_unique_and_counted() {
        let registry = OperationRegistry::new();
        let a = registry.generate_token();
        registry.register(a, OperationKind::BackupWait, None).unwrap();
        let b = registry.generate_token();
        assert_ne!(a, b);
        assert_eq!((a & 0xFF) + 1, b & 0xFF);
    }

    #[test]
    fn second_completion_is_dropped() {
        let registry = OperationRegistry::new();
        let counter = Arc::new(Counter::default());
        registry.register(7, OperationKind::BackupWait, callback(&counter)).unwrap();

        registry.complete(7, 1);
        registry.complete(7, 2);
        registry.cancel(7, false);

        assert_eq!(counter.completes.load(Ordering::SeqCst), 1);
        assert_eq!(counter.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(registry.state(7), Some(OperationState::Acknowledged));
        assert_eq!(registry.await_result(7), Some(1));
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_wins_over_late_completion() {
        let registry = OperationRegistry::new();
        let counter = Arc::new(Counter::default());
        registry.register(9, OperationKind::RestoreWait, callback(&counter)).unwrap();

        registry.cancel(9, false);
        registry.complete(9, 0);

        assert_eq!(counter.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(counter.completes.load(Ordering::SeqCst), 0);
        assert!(!registry.block_until_complete(9));
    }

    #[test]
    fn unknown_tokens_are_no_ops() {
        let registry = OperationRegistry::new();
        registry.complete(1, 0);
        registry.cancel(1, true);
        assert!(!registry.block_until_complete(1));
    }

    #[test]
    fn duplicate_register_is_rejected() {
        let registry = OperationRegistry::new();
        registry.register(5, OperationKind::BackupWait, None).unwrap();
        let err = registry.register(5, OperationKind::RestoreWait, None).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateToken { token: 5 }));
        registry.complete(5, 0);
        assert!(registry.block_until_complete(5));
        // Removed by its owner, the token can be used again.
        registry.register(5, OperationKind::RestoreWait, None).unwrap();
    }

    #[test]
    fn duplicate_register_from_another_thread() {
        let registry = OperationRegistry::new();
        registry.register(11, OperationKind::BackupWait, None).unwrap();
        let other = registry.clone();
        let result = thread::spawn(move || other.register(11, OperationKind::BackupWait, None))
            .join()
            .unwrap();
        assert!(result.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_registers_of_one_token_admit_exactly_one() {
        for round in 0..50u32 {
            let registry = OperationRegistry::new();
            let token = 100 + round;
            let start = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [OperationKind::BackupWait, OperationKind::RestoreWait]
                .into_iter()
                .map(|kind| {
                    let registry = registry.clone();
                    let start = start.clone();
                    thread::spawn(move || {
                        start.wait();
                        registry.register(token, kind, None)
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results
                .iter()
                .any(|r| matches!(r, Err(CoreError::DuplicateToken { token: t }) if *t == token)));
            assert_eq!(registry.len(), 1);
        }
    }

    #[test]
    fn block_wakes_on_completion_from_another_thread() {
        let registry = OperationRegistry::new();
        registry.register(3, OperationKind::BackupWait, None).unwrap();
        let other = registry.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            Completion::new(3, other).complete(42);
        });
        assert_eq!(registry.await_result(3), Some(42));
        handle.join().unwrap();
    }

    #[test]
    fn timeout_cancels_pending_operation() {
        let registry = OperationRegistry::new();
        let counter = Arc::new(Counter::default());
        registry
            .prepare(4, OperationKind::BackupWait, Duration::from_millis(20), callback(&counter))
            .unwrap();
        assert!(!registry.block_until_complete(4));
        assert_eq!(counter.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_after_completion_is_inert() {
        let registry = OperationRegistry::new();
        let counter = Arc::new(Counter::default());
        registry
            .prepare(6, OperationKind::BackupWait, Duration::from_millis(10), callback(&counter))
            .unwrap();
        registry.complete(6, 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(registry.state(6), Some(OperationState::Acknowledged));
    }

    #[test]
    fn cancel_all_of_kind_only_touches_that_kind() {
        let registry = OperationRegistry::new();
        registry.register(1, OperationKind::BackupTask, None).unwrap();
        registry.register(2, OperationKind::BackupTask, None).unwrap();
        registry.register(3, OperationKind::RestoreWait, None).unwrap();

        assert_eq!(registry.cancel_all_of_kind(OperationKind::BackupTask, true), 2);
        assert_eq!(registry.state(1), Some(OperationState::TimedOut));
        assert_eq!(registry.state(3), Some(OperationState::Pending));
        // Already cancelled: nothing left to cancel.
        assert_eq!(registry.cancel_all_of_kind(OperationKind::BackupTask, true), 0);
    }

    #[test]
    fn dropped_callback_is_skipped() {
        let registry = OperationRegistry::new();
        let counter = Arc::new(Counter::default());
        registry.register(8, OperationKind::BackupWait, callback(&counter)).unwrap();
        drop(counter);
        registry.complete(8, 0);
        assert_eq!(registry.state(8), Some(OperationState::Acknowledged));
    }
}

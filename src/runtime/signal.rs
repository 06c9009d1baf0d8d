//! Single-producer/multi-consumer wake primitive.
//!
//! A [`Monitor`] owns a FIFO of signals behind a mutex + condvar; every
//! blocking wait in the fabric goes through one. A [`Notifier`] holds a weak
//! back-reference so dropping the monitor silently turns notifies into
//! no-ops — relation, not ownership.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// An event occurrence: who raised it and what happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signal {
    pub sender: String,
    pub payload: String,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<Signal>>,
    wakeup: Condvar,
}

fn lock_queue(shared: &Shared) -> MutexGuard<'_, VecDeque<Signal>> {
    match shared.queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Central receiver of [`Signal`]s from any number of notifiers.
pub struct Monitor {
    shared: Arc<Shared>,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    /// Waits for the next signal until the timeout elapses. Spurious condvar
    /// wakeups are absorbed here and never surface.
    pub fn wait(&self, timeout: Duration) -> Option<Signal> {
        let deadline = Instant::now() + timeout;
        let mut queue = lock_queue(&self.shared);
        loop {
            if let Some(signal) = queue.pop_front() {
                return Some(signal);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _outcome) = match self.shared.wakeup.wait_timeout(queue, deadline - now) {
                Ok(pair) => pair,
                Err(poisoned) => {
                    let pair = poisoned.into_inner();
                    (pair.0, pair.1)
                }
            };
            queue = guard;
        }
    }

    /// Creates a notifier bound to this monitor under the given sender name.
    pub fn notifier(&self, sender: impl Into<String>) -> Notifier {
        Notifier {
            sender: sender.into(),
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Weakly-bound signal source for one monitor.
#[derive(Clone)]
pub struct Notifier {
    sender: String,
    shared: Weak<Shared>,
}

impl Notifier {
    /// Enqueues a signal and wakes all waiters. Returns false (a no-op) once
    /// the monitor is gone.
    pub fn notify(&self, payload: &str) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        lock_queue(&shared).push_back(Signal {
            sender: self.sender.clone(),
            payload: payload.to_string(),
        });
        shared.wakeup.notify_all();
        true
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }
}

/// Shared stop latch: raise once, observed by a loop at its next tick.
#[derive(Clone, Default)]
pub struct StopFlag {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    raised: AtomicBool,
    watcher: Mutex<Option<Notifier>>,
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the flag to a monitor so `raise` also wakes its loop.
    pub fn watch(&self, monitor: &Monitor) {
        let notifier = monitor.notifier("stop");
        match self.inner.watcher.lock() {
            Ok(mut guard) => *guard = Some(notifier),
            Err(poisoned) => *poisoned.into_inner() = Some(notifier),
        }
    }

    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        let watcher = match self.inner.watcher.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(notifier) = watcher {
            notifier.notify("stop");
        }
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }
}

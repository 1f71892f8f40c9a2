//! Per-worker idle-timeout bookkeeping.
//!
//! Every worker owns one [`ConnectionTimeoutManager`] shared by the
//! connections it serves. The idle deadline only runs while a connection
//! is waiting for the next request:
//!
//! 1. A registered connection is armed with `now + idle_timeout`.
//! 2. Read or write progress disables the timer for the rest of the cycle.
//! 3. Completing a request/response cycle re-arms it.
//! 4. A protocol upgrade disables it permanently.
//! 5. A tick aborts every armed connection whose deadline has passed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::{Notify, futures::Notified};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::http::connection::ConnectionId;

/// The manager as shared between a worker's connections and its ticker.
pub type SharedTimeouts = Rc<RefCell<ConnectionTimeoutManager>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutMode {
    Armed { deadline: Instant },
    Disabled,
    /// Set once a connection upgrades; nothing re-arms it.
    PermanentlyDisabled,
}

#[derive(Debug)]
struct Entry {
    mode: TimeoutMode,
    abort: Rc<Notify>,
}

#[derive(Debug)]
pub struct ConnectionTimeoutManager {
    idle_timeout: Duration,
    entries: HashMap<ConnectionId, Entry>,
}

impl ConnectionTimeoutManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            entries: HashMap::new(),
        }
    }

    pub fn shared(idle_timeout: Duration) -> SharedTimeouts {
        Rc::new(RefCell::new(Self::new(idle_timeout)))
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Track a new connection, armed. `abort` is notified when it expires.
    pub fn register(&mut self, id: ConnectionId, abort: Rc<Notify>) {
        let deadline = Instant::now() + self.idle_timeout;
        self.entries.insert(
            id,
            Entry {
                mode: TimeoutMode::Armed { deadline },
                abort,
            },
        );
    }

    pub fn on_activity(&mut self, id: ConnectionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.mode != TimeoutMode::PermanentlyDisabled {
                entry.mode = TimeoutMode::Disabled;
            }
        }
    }

    pub fn on_cycle_complete(&mut self, id: ConnectionId) {
        let deadline = Instant::now() + self.idle_timeout;
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.mode != TimeoutMode::PermanentlyDisabled {
                entry.mode = TimeoutMode::Armed { deadline };
            }
        }
    }

    pub fn on_upgrade(&mut self, id: ConnectionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.mode = TimeoutMode::PermanentlyDisabled;
        }
    }

    /// Abort every armed connection whose deadline is at or before `now`.
    ///
    /// Expired entries are removed, so each connection is aborted at most
    /// once. Returns the ids that expired.
    pub fn tick(&mut self, now: Instant) -> Vec<ConnectionId> {
        let expired: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.mode, TimeoutMode::Armed { deadline } if deadline <= now)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                entry.abort.notify_one();
            }
        }

        expired
    }

    pub fn remove(&mut self, id: ConnectionId) {
        self.entries.remove(&id);
    }

    pub fn mode(&self, id: ConnectionId) -> Option<TimeoutMode> {
        self.entries.get(&id).map(|entry| entry.mode)
    }

    pub fn armed_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| matches!(entry.mode, TimeoutMode::Armed { .. }))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A connection's registration with its worker's timeout manager.
///
/// Dropping it removes the registration.
#[derive(Debug)]
pub struct TimeoutEntry {
    id: ConnectionId,
    manager: SharedTimeouts,
    abort: Rc<Notify>,
    released: bool,
}

impl TimeoutEntry {
    pub fn register(id: ConnectionId, manager: &SharedTimeouts) -> Self {
        let abort = Rc::new(Notify::new());
        manager.borrow_mut().register(id, abort.clone());
        Self {
            id,
            manager: manager.clone(),
            abort,
            released: false,
        }
    }

    pub fn activity(&self) {
        self.manager.borrow_mut().on_activity(self.id);
    }

    pub fn cycle_complete(&self) {
        self.manager.borrow_mut().on_cycle_complete(self.id);
    }

    pub fn upgraded(&self) {
        self.manager.borrow_mut().on_upgrade(self.id);
    }

    /// `None` once the entry expired or was released.
    pub fn mode(&self) -> Option<TimeoutMode> {
        self.manager.borrow().mode(self.id)
    }

    /// Resolves when the manager aborts this connection. An abort that fires
    /// while nobody is waiting is kept until the next call.
    pub fn aborted(&self) -> Notified<'_> {
        self.abort.notified()
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.borrow_mut().remove(self.id);
        }
    }
}

impl Drop for TimeoutEntry {
    fn drop(&mut self) {
        self.release();
    }
}

/// Run the manager's tick on a fixed period until the task is aborted.
pub async fn drive_ticks(manager: SharedTimeouts, period: Duration, worker_id: usize) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let expired = manager.borrow_mut().tick(Instant::now());
        if expired.is_empty() {
            continue;
        }

        debug!(worker_id, count = expired.len(), "idle connections expired");
        for id in expired {
            trace!(worker_id, conn = %id, "aborting idle connection");
        }
    }
}

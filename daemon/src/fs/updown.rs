//! A two-way shared lock over a node's directory tree.
//!
//! The lock can be held "up" or "down": any number of holders may share
//! one direction, but the directions are mutually exclusive. Tasks
//! creating directories (transfers renaming into place) hold the lock
//! up; tasks removing directories (deletion pruning empty parents) hold
//! it down. This keeps bulk observers from seeing half-finished tree
//! mutations.
//!
//! Waiters are granted strictly in FIFO order: once a waiter of the
//! opposite direction is queued, later arrivals of the current direction
//! queue behind it, so neither direction starves.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// A lock direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Directory creation.
    Up,

    /// Directory removal.
    Down,
}

struct Waiter {
    dir: Direction,
    tx: oneshot::Sender<UpDownGuard>,
}

struct LockState {
    /// Positive while held up, negative while held down, zero when free.
    /// The magnitude is the number of holders.
    count: i64,
    waiters: VecDeque<Waiter>,
}

impl LockState {
    fn compatible(&self, dir: Direction) -> bool {
        match dir {
            Direction::Up => self.count >= 0,
            Direction::Down => self.count <= 0,
        }
    }

    fn adjust(&mut self, dir: Direction) {
        match dir {
            Direction::Up => self.count += 1,
            Direction::Down => self.count -= 1,
        }
    }

    fn unadjust(&mut self, dir: Direction) {
        match dir {
            Direction::Up => self.count -= 1,
            Direction::Down => self.count += 1,
        }
    }
}

/// Grants the front waiter batch. Must be called with the lock free.
fn grant_waiters(state: &Arc<Mutex<LockState>>, s: &mut LockState) {
    loop {
        let first_dir = match s.waiters.front() {
            Some(w) => w.dir,
            None => return,
        };

        if !s.compatible(first_dir) {
            return;
        }

        let mut granted_any = false;
        while let Some(w) = s.waiters.front() {
            if w.dir != first_dir {
                break;
            }

            let w = s.waiters.pop_front().unwrap();
            s.adjust(w.dir);

            let guard = UpDownGuard {
                state: state.clone(),
                dir: w.dir,
            };
            match w.tx.send(guard) {
                Ok(()) => granted_any = true,
                Err(guard) => {
                    // The waiter gave up. Skip its Drop: we're holding
                    // the state mutex, and nothing was really granted.
                    std::mem::forget(guard);
                    s.unadjust(w.dir);
                }
            }
        }

        if granted_any || s.count != 0 {
            return;
        }

        // The whole batch had gone away; try the next one
    }
}

/// The update-down lock.
pub struct UpDownLock {
    state: Arc<Mutex<LockState>>,
}

impl UpDownLock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LockState {
                count: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquires the lock in the up (directory-creating) direction.
    pub async fn up(&self) -> UpDownGuard {
        self.acquire(Direction::Up).await
    }

    /// Acquires the lock in the down (directory-removing) direction.
    pub async fn down(&self) -> UpDownGuard {
        self.acquire(Direction::Down).await
    }

    async fn acquire(&self, dir: Direction) -> UpDownGuard {
        let rx = {
            let mut s = self.state.lock().unwrap();

            if s.compatible(dir) && s.waiters.is_empty() {
                s.adjust(dir);
                return UpDownGuard {
                    state: self.state.clone(),
                    dir,
                };
            }

            let (tx, rx) = oneshot::channel();
            s.waiters.push_back(Waiter { dir, tx });
            rx
        };

        // The granter constructs the guard; if we go away instead, the
        // in-flight guard's Drop releases the lock for us.
        rx.await.expect("update-down lock destroyed while waiting")
    }
}

impl Default for UpDownLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the lock in one direction until dropped.
pub struct UpDownGuard {
    state: Arc<Mutex<LockState>>,
    dir: Direction,
}

impl Drop for UpDownGuard {
    fn drop(&mut self) {
        let state = self.state.clone();
        let mut s = state.lock().unwrap();
        s.unadjust(self.dir);
        if s.count == 0 {
            grant_waiters(&self.state, &mut s);
        }
    }
}

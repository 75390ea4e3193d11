//! Synchronization primitives for the chain core.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Open,
    Locked,
    Closed,
}

/// A mutual-exclusion lock that can be permanently closed.
///
/// This serializes all chain mutations. [`ClosableLock::lock`] blocks while
/// another writer holds the lock and returns `None` once the lock has been
/// closed; [`ClosableLock::close`] waits for the current writer to drain and
/// then rejects all future writers. Closing is irreversible.
#[derive(Debug, Default)]
pub struct ClosableLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl Default for LockState {
    fn default() -> Self {
        Self::Open
    }
}

impl ClosableLock {
    /// Creates an open lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, blocking while it is held elsewhere.
    ///
    /// Returns `None` if the lock has been closed.
    pub fn lock(&self) -> Option<ClosableLockGuard<'_>> {
        let mut state = self.state.lock();
        loop {
            match *state {
                LockState::Open => {
                    *state = LockState::Locked;
                    return Some(ClosableLockGuard { lock: self });
                }
                LockState::Locked => self.cond.wait(&mut state),
                LockState::Closed => return None,
            }
        }
    }

    /// Closes the lock: waits for the current holder, then makes every
    /// subsequent and queued [`ClosableLock::lock`] return `None`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        while *state == LockState::Locked {
            self.cond.wait(&mut state);
        }
        *state = LockState::Closed;
        self.cond.notify_all();
    }

    /// Whether the lock has been closed.
    pub fn is_closed(&self) -> bool {
        *self.state.lock() == LockState::Closed
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        if *state == LockState::Locked {
            *state = LockState::Open;
        }
        drop(state);
        self.cond.notify_all();
    }
}

/// Guard returned by [`ClosableLock::lock`]; releases the lock on drop.
#[derive(Debug)]
pub struct ClosableLockGuard<'a> {
    lock: &'a ClosableLock,
}

impl Drop for ClosableLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Counts in-flight operations so shutdown can wait for them to drain.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    /// Creates an empty wait group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an in-flight operation; the guard deregisters on drop.
    pub fn enter(&self) -> WaitGroupGuard<'_> {
        *self.count.lock() += 1;
        WaitGroupGuard { group: self }
    }

    /// Blocks until all registered operations have finished.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }
}

/// Guard returned by [`WaitGroup::enter`].
#[derive(Debug)]
pub struct WaitGroupGuard<'a> {
    group: &'a WaitGroup,
}

impl Drop for WaitGroupGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.group.count.lock();
        *count -= 1;
        drop(count);
        self.group.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn lock_excludes_and_reopens() {
        let lock = Arc::new(ClosableLock::new());
        let guard = lock.lock().unwrap();

        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.lock().is_some())
        };
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(contender.join().unwrap());
    }

    #[test]
    fn close_rejects_future_lockers() {
        let lock = ClosableLock::new();
        lock.close();
        assert!(lock.lock().is_none());
        assert!(lock.is_closed());
    }

    #[test]
    fn close_drains_current_holder() {
        let lock = Arc::new(ClosableLock::new());
        let guard = lock.lock().unwrap();

        let closer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.close())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!lock.is_closed());
        drop(guard);
        closer.join().unwrap();
        assert!(lock.lock().is_none());
    }

    #[test]
    fn queued_waiters_drain_through_close() {
        // A waiter queued behind the holder either wins the lock one last
        // time or observes the close; the lock always ends up closed.
        let lock = Arc::new(ClosableLock::new());
        let guard = lock.lock().unwrap();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || drop(lock.lock()))
        };
        let closer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.close())
        };
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        waiter.join().unwrap();
        closer.join().unwrap();
        assert!(lock.lock().is_none());
    }

    #[test]
    fn wait_group_waits_for_all() {
        let group = Arc::new(WaitGroup::new());
        let guard = group.enter();

        let waiter = {
            let group = Arc::clone(&group);
            thread::spawn(move || group.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.join().unwrap();
    }
}

//! Thread and monitor registry.
//!
//! `AsyncMthdCall` starts an OS thread and records its join handle under a
//! numeric id that the program keeps in an instance field. Monitors back the
//! `CriticalStart`/`CriticalEnd` pair; unlike a `MutexGuard` a monitor is
//! entered and left by two separate instructions, so it is a flag guarded by
//! a mutex plus a condition variable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tracing::debug;

use super::RuntimeFault;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct Monitor {
    held: Mutex<bool>,
    released: Condvar,
}

impl Monitor {
    fn enter(&self) {
        let mut held = lock(&self.held);
        while *held {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        *held = true;
    }

    fn exit(&self) {
        *lock(&self.held) = false;
        self.released.notify_one();
    }
}

pub struct ThreadRegistry {
    next_id: AtomicI64,
    threads: Mutex<HashMap<i64, JoinHandle<()>>>,
    monitors: Mutex<Vec<Arc<Monitor>>>,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            threads: Mutex::new(HashMap::new()),
            monitors: Mutex::new(Vec::new()),
        }
    }

    /// Run `f` on a new thread; returns its id.
    pub fn spawn<F>(&self, f: F) -> i64
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = std::thread::spawn(f);
        lock(&self.threads).insert(id, handle);
        debug!(id, "thread started");
        id
    }

    /// Wait for thread `id`. Each thread can be joined once.
    pub fn join(&self, id: i64) -> Result<(), RuntimeFault> {
        let handle = lock(&self.threads)
            .remove(&id)
            .ok_or(RuntimeFault::InvalidThread { id })?;
        // a panicking VM thread has already reported its fault
        let _ = handle.join();
        debug!(id, "thread joined");
        Ok(())
    }

    /// Wait for every thread still running.
    pub fn join_all(&self) {
        loop {
            let handles: Vec<_> = lock(&self.threads).drain().collect();
            if handles.is_empty() {
                break;
            }
            for (_, handle) in handles {
                let _ = handle.join();
            }
        }
    }

    /// Register a monitor; ids start at 1 so that 0 stays "none".
    pub fn new_monitor(&self) -> i64 {
        let mut monitors = lock(&self.monitors);
        monitors.push(Arc::new(Monitor::default()));
        monitors.len() as i64
    }

    fn monitor(&self, id: i64) -> Result<Arc<Monitor>, RuntimeFault> {
        let index = usize::try_from(id - 1).map_err(|_| RuntimeFault::InvalidThread { id })?;
        lock(&self.monitors)
            .get(index)
            .cloned()
            .ok_or(RuntimeFault::InvalidThread { id })
    }

    pub fn enter(&self, id: i64) -> Result<(), RuntimeFault> {
        self.monitor(id)?.enter();
        Ok(())
    }

    pub fn exit(&self, id: i64) -> Result<(), RuntimeFault> {
        self.monitor(id)?.exit();
        Ok(())
    }
}

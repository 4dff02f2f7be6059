//! Worker thread management
//!
//! Workers are plain named OS threads. Each one runs a single entry
//! function (the scheduler's dispatch loop) to completion and is joined
//! on shutdown.

use corio_core::error::{RuntimeError, RuntimeResult};
use corio_core::{kdebug, kerror};
use std::thread::{self, JoinHandle};

/// Pool of worker threads belonging to one scheduler
pub struct WorkerPool {
    name: String,
    handles: Vec<(usize, JoinHandle<()>)>,
}

impl WorkerPool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handles: Vec::new(),
        }
    }

    /// Spawn worker `index`, named `<name>_<index>`
    pub fn spawn<F>(&mut self, index: usize, f: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("{}_{}", self.name, index))
            .spawn(f)
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;
        self.handles.push((index, handle));
        Ok(())
    }

    /// Wait for every spawned worker to finish. Safe to call more than once.
    pub fn join(&mut self) {
        for (index, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                kerror!("{}_{} panicked", self.name, index);
            } else {
                kdebug!("{}_{} joined", self.name, index);
            }
        }
    }

    /// Number of workers not yet joined
    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_spawn_names_and_join() {
        let mut pool = WorkerPool::new("pool");
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            pool.spawn(i, move || {
                let name = thread::current().name().map(str::to_string);
                seen.lock().push(name);
            })
            .unwrap();
        }
        assert_eq!(pool.len(), 3);
        pool.join();
        assert!(pool.is_empty());

        let mut names: Vec<_> = seen.lock().iter().flatten().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["pool_0", "pool_1", "pool_2"]);
    }

    #[test]
    fn test_join_twice() {
        let mut pool = WorkerPool::new("twice");
        let n = Arc::new(AtomicUsize::new(0));
        let c = n.clone();
        pool.spawn(0, move || { c.fetch_add(1, Ordering::SeqCst); }).unwrap();
        pool.join();
        pool.join();
        assert_eq!(n.load(Ordering::SeqCst), 1);
    }
}

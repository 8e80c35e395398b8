//! Background worker threads
//!
//! [`Worker`] runs a tick on a fixed period until stopped. [`Debouncer`]
//! batches keys and hands them to a handler once notifications have been
//! quiet for the configured delay (or have kept arriving for ten delays).

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

struct StopFlag {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Periodic background thread, stopped and joined on drop
pub struct Worker {
    name: String,
    flag: Arc<StopFlag>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn periodic<F>(name: &str, period: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let flag = Arc::new(StopFlag {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        });
        let shared = flag.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let deadline = Instant::now() + period;
                let mut stopped = shared.stopped.lock();
                while !*stopped {
                    if shared.cv.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                if *stopped {
                    break;
                }
                drop(stopped);
                tick();
            })?;
        debug!(worker = name, ?period, "worker started");
        Ok(Self {
            name: name.to_string(),
            flag,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&mut self) {
        *self.flag.stopped.lock() = true;
        self.flag.cv.notify_all();
        join_unless_current(self.handle.take(), &self.name);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_unless_current(handle: Option<JoinHandle<()>>, name: &str) {
    if let Some(handle) = handle {
        // a worker may drop the last owner of itself from inside a tick
        if handle.thread().id() != thread::current().id() && handle.join().is_err() {
            error!(worker = name, "worker thread panicked");
        }
    }
}

struct Batch<K> {
    keys: HashSet<K>,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
    stopped: bool,
}

struct DebounceShared<K> {
    batch: Mutex<Batch<K>>,
    cv: Condvar,
}

/// Batches notifications and flushes them after a quiet period
pub struct Debouncer<K> {
    name: String,
    shared: Arc<DebounceShared<K>>,
    handle: Option<JoinHandle<()>>,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Send + 'static,
{
    pub fn new<F>(name: &str, delay: Duration, mut handler: F) -> std::io::Result<Self>
    where
        F: FnMut(Vec<K>) + Send + 'static,
    {
        let shared = Arc::new(DebounceShared {
            batch: Mutex::new(Batch {
                keys: HashSet::new(),
                first_at: None,
                last_at: None,
                stopped: false,
            }),
            cv: Condvar::new(),
        });
        let worker = shared.clone();
        let max_wait = delay * 10;
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut batch = worker.batch.lock();
                loop {
                    if batch.stopped {
                        break;
                    }
                    let (Some(first), Some(last)) = (batch.first_at, batch.last_at) else {
                        worker.cv.wait(&mut batch);
                        continue;
                    };
                    let due = (last + delay).min(first + max_wait);
                    if Instant::now() < due {
                        worker.cv.wait_until(&mut batch, due);
                        continue;
                    }
                    let keys: Vec<K> = batch.keys.drain().collect();
                    batch.first_at = None;
                    batch.last_at = None;
                    MutexGuard::unlocked(&mut batch, || handler(keys));
                }
            })?;
        Ok(Self {
            name: name.to_string(),
            shared,
            handle: Some(handle),
        })
    }

    pub fn notify(&self, key: K) {
        let mut batch = self.shared.batch.lock();
        let now = Instant::now();
        batch.keys.insert(key);
        batch.first_at.get_or_insert(now);
        batch.last_at = Some(now);
        self.shared.cv.notify_one();
    }
}

impl<K> Debouncer<K> {
    /// Keys waiting for the next flush
    pub fn pending(&self) -> usize {
        self.shared.batch.lock().keys.len()
    }

    pub fn stop(&mut self) {
        self.shared.batch.lock().stopped = true;
        self.shared.cv.notify_all();
        join_unless_current(self.handle.take(), &self.name);
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        self.stop();
    }
}

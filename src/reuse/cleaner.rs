//! Background reuse cleaner
//!
//! One worker thread periodically trims aged entries out of every registered
//! reuse cache. The thread parks on a condition variable between passes so a
//! stop request takes effect immediately instead of after the interval, and
//! it holds no lock while trimming beyond each cache's own mutex.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::cache::ReuseCache;

#[derive(Debug)]
struct CleanerShared {
    state: Mutex<CleanerState>,
    wake: Condvar,
}

#[derive(Debug)]
struct CleanerState {
    stop: bool,
    caches: Vec<Weak<ReuseCache>>,
}

/// Periodic age-based trimmer for reuse caches.
#[derive(Debug)]
pub struct ReuseCleaner {
    shared: Arc<CleanerShared>,
    handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl ReuseCleaner {
    /// Default interval between trim passes
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

    /// Spawn the cleaner thread with the given pass interval.
    pub fn start(interval: Duration) -> Self {
        let shared = Arc::new(CleanerShared {
            state: Mutex::new(CleanerState {
                stop: false,
                caches: Vec::new(),
            }),
            wake: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("unipool-reuse-cleaner".to_string())
            .spawn(move || cleaner_loop(worker_shared, interval))
            .ok();

        if handle.is_none() {
            debug!("reuse cleaner thread could not be spawned; trimming is caller-driven");
        }

        ReuseCleaner {
            shared,
            handle,
            interval,
        }
    }

    /// Register a cache for periodic trimming. The cleaner holds only a weak
    /// reference; dropping the cache unregisters it.
    pub fn register(&self, cache: &Arc<ReuseCache>) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.caches.push(Arc::downgrade(cache));
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Request the worker to stop and wait for it to exit.
    pub fn stop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            if state.stop {
                return;
            }
            state.stop = true;
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        info!("reuse cleaner stopped");
    }
}

impl Drop for ReuseCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn cleaner_loop(shared: Arc<CleanerShared>, interval: Duration) {
    loop {
        // Park until the interval elapses or a stop request arrives
        let caches: Vec<Arc<ReuseCache>> = {
            let guard = match shared.state.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let (mut guard, _) = match shared.wake.wait_timeout_while(
                guard,
                interval,
                |state| !state.stop,
            ) {
                Ok(result) => result,
                Err(_) => return,
            };
            if guard.stop {
                return;
            }
            // Prune caches that went away while collecting the live ones
            let mut live = Vec::with_capacity(guard.caches.len());
            guard.caches.retain(|weak| match weak.upgrade() {
                Some(cache) => {
                    live.push(cache);
                    true
                }
                None => false,
            });
            live
        };

        let now = Instant::now();
        for cache in caches {
            let cutoff = now
                .checked_sub(cache.max_age())
                .unwrap_or_else(Instant::now);
            let trimmed = cache.trim_old_allocs(cutoff, false);
            if trimmed > 0 {
                debug!(trimmed, memory_type = %cache.memory_type(), "cleaner pass");
            }
        }
    }
}

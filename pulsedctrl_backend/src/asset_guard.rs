//! Set of hardware assets currently being compiled or uploaded, shared between the generator and
//! measurement threads.
//!
//! The generator worker marks an asset busy for the duration of a sample or load call. Before
//! starting or resuming, the measurement side waits a bounded time for its loaded asset with
//! [`AssetGuard::wait_idle`] and refuses if it is still busy.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct AssetGuard {
    busy: Mutex<BTreeSet<String>>,
    released: Condvar,
}

impl AssetGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks `name` busy until the returned token is dropped.
    pub fn begin(self: &Arc<Self>, name: &str) -> InFlight {
        self.busy.lock().insert(name.to_string());
        tracing::debug!("Asset {} in flight", name);
        InFlight {
            guard: self.clone(),
            name: name.to_string(),
        }
    }

    pub fn is_busy(&self, name: &str) -> bool {
        self.busy.lock().contains(name)
    }

    pub fn busy_assets(&self) -> Vec<String> {
        self.busy.lock().iter().cloned().collect()
    }

    /// Blocks until `name` is released or `timeout` passes. Returns whether it is idle.
    pub fn wait_idle(&self, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut busy = self.busy.lock();
        while busy.contains(name) {
            if self.released.wait_until(&mut busy, deadline).timed_out() {
                return !busy.contains(name);
            }
        }
        true
    }

    fn release(&self, name: &str) {
        self.busy.lock().remove(name);
        self.released.notify_all();
    }
}

/// Busy marker of one asset, released on drop.
pub struct InFlight {
    guard: Arc<AssetGuard>,
    name: String,
}

impl InFlight {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.guard.release(&self.name);
        tracing::debug!("Asset {} released", self.name);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn token_releases_on_drop() {
        let guard = AssetGuard::new();
        {
            let token = guard.begin("rabi");
            assert_eq!(token.name(), "rabi");
            assert!(guard.is_busy("rabi"));
            assert!(!guard.is_busy("ramsey"));
            assert_eq!(guard.busy_assets(), vec!["rabi"]);
        }
        assert!(!guard.is_busy("rabi"));
    }

    #[test]
    fn wait_idle_wakes_on_release() {
        let guard = AssetGuard::new();
        let token = guard.begin("rabi");
        assert!(!guard.wait_idle("rabi", Duration::from_millis(10)));

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(token);
        });
        assert!(guard.wait_idle("rabi", Duration::from_secs(5)));
        worker.join().unwrap();
    }
}

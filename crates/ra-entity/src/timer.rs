//! One-shot debounce timer that re-arms on demand

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Fires its callback once, `interval` after being set
///
/// Setting an armed timer is a no-op, so a burst of requests produces one callback.
pub struct RetryTimer {
    name: &'static str,
    interval: Mutex<Duration>,
    callback: Callback,
    armed: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RetryTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTimer")
            .field("name", &self.name)
            .field("interval", &*self.interval.lock())
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl RetryTimer {
    /// Create an unarmed timer
    pub fn new<F>(name: &'static str, interval: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            name,
            interval: Mutex::new(interval),
            callback: Arc::new(callback),
            armed: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Timer name used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Change the delay used by subsequent arms
    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock() = interval;
    }

    /// Arm the timer unless it is already armed
    pub fn set(&self) {
        if self.armed.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(timer = self.name, "no runtime available; timer not armed");
            self.armed.store(false, Ordering::SeqCst);
            return;
        };

        let interval = *self.interval.lock();
        let armed = Arc::clone(&self.armed);
        let callback = Arc::clone(&self.callback);
        let name = self.name;
        let handle = runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            armed.store(false, Ordering::SeqCst);
            tracing::trace!(timer = name, "retry timer fired");
            callback();
        });
        *self.handle.lock() = Some(handle);
    }

    /// Disarm without firing
    pub fn cancel(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        self.armed.store(false, Ordering::SeqCst);
    }

    /// Whether a callback is pending
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

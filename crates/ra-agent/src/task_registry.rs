//! Shared task registry for agent background work
//!
//! Tracks the retry passes, node activation sweeps and periodic cleanup so that closing the
//! agent stops all of them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use ra_core::{CancellationToken, TaskSpawner};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owner side of a cancellation signal
#[derive(Debug)]
pub struct CancellationSource {
    cancel_tx: watch::Sender<bool>,
}

impl CancellationSource {
    /// Fresh, uncancelled source
    pub fn new() -> Self {
        let (cancel_tx, _cancel_rx) = watch::channel(false);
        Self { cancel_tx }
    }

    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Token observing this source
    pub fn token(&self) -> Arc<dyn CancellationToken> {
        Arc::new(WatchCancellationToken {
            cancel_rx: self.cancel_tx.subscribe(),
        })
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct WatchCancellationToken {
    cancel_rx: watch::Receiver<bool>,
}

#[async_trait::async_trait]
impl CancellationToken for WatchCancellationToken {
    async fn cancelled(&self) {
        let mut cancel_rx = self.cancel_rx.clone();
        loop {
            if *cancel_rx.borrow() {
                return;
            }
            if cancel_rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }
}

/// Background tasks of one agent
#[derive(Debug)]
pub struct TaskRegistry {
    shutdown: CancellationSource,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            shutdown: CancellationSource::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a task that runs until it completes or the registry shuts down
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return;
        }
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => {}
                _ = fut => {}
            }
        });
        self.track(handle);
    }

    /// Run `f` every `interval` until it returns `false` or the registry shuts down
    ///
    /// The first run happens after one interval.
    pub fn spawn_interval_until<F, Fut>(&self, interval: Duration, mut f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        if self.is_shutdown() {
            return;
        }
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|stop| *stop) => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !f().await {
                    break;
                }
            }
        });
        self.track(handle);
    }

    /// Stop every tracked task; later spawns are ignored
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    /// Whether [`TaskRegistry::shutdown`] ran
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled at shutdown
    pub fn cancellation_token(&self) -> Arc<dyn CancellationToken> {
        self.shutdown.token()
    }

    /// Number of tracked tasks that have not finished
    pub fn active_tasks(&self) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|handle| !handle.is_finished());
        handles.len()
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        handles.retain(|existing| !existing.is_finished());
        handles.push(handle);
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TaskSpawner for TaskRegistry {
    fn spawn(&self, fut: BoxFuture<'static, ()>) {
        TaskRegistry::spawn(self, fut);
    }

    fn spawn_cancellable(&self, fut: BoxFuture<'static, ()>, token: Arc<dyn CancellationToken>) {
        TaskRegistry::spawn(self, async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    fn cancellation_token(&self) -> Arc<dyn CancellationToken> {
        TaskRegistry::cancellation_token(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_cancellation_source_wakes_token() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        source.cancel();
        source.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_runs_until_false() {
        let registry = TaskRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        registry.spawn_interval_until(Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move { counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(registry.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_tasks_and_rejects_new_ones() {
        let registry = TaskRegistry::new();
        let token = registry.cancellation_token();
        registry.spawn(futures::future::pending::<()>());
        assert_eq!(registry.active_tasks(), 1);

        registry.shutdown();
        assert!(token.is_cancelled());
        assert_eq!(registry.active_tasks(), 0);

        registry.spawn(async {});
        assert_eq!(registry.active_tasks(), 0);
    }

    #[tokio::test]
    async fn test_cancellable_spawn_stops_on_token() {
        let registry = TaskRegistry::new();
        let source = CancellationSource::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&finished);
        TaskSpawner::spawn_cancellable(
            &registry,
            Box::pin(async move {
                futures::future::pending::<()>().await;
                flag.fetch_add(1, Ordering::SeqCst);
            }),
            source.token(),
        );

        source.cancel();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(registry.active_tasks(), 0);
    }
}

//! Runtime-agnostic task spawning and cooperative cancellation

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Cooperative cancellation token
///
/// Long-running sweeps check [`CancellationToken::is_cancelled`] between steps.
#[async_trait]
pub trait CancellationToken: Send + Sync {
    /// Resolves when cancellation is requested
    async fn cancelled(&self);

    /// Non-blocking cancellation check
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Task spawning contract for runtime implementations
pub trait TaskSpawner: Send + Sync {
    /// Spawn a background task
    fn spawn(&self, fut: BoxFuture<'static, ()>);

    /// Spawn a background task that stops when `token` is cancelled
    fn spawn_cancellable(&self, fut: BoxFuture<'static, ()>, token: Arc<dyn CancellationToken>);

    /// Token cancelled when the spawner shuts down
    fn cancellation_token(&self) -> Arc<dyn CancellationToken>;
}

/// Cancellation token that never triggers
pub struct NeverCancel;

#[async_trait]
impl CancellationToken for NeverCancel {
    async fn cancelled(&self) {
        futures::future::pending::<()>().await;
    }
}

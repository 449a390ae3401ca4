//! Reconnection timer service.
//!
//! One pending, cancellable countdown per seat token. Arming overwrites
//! any prior timer for the token; cancelling is idempotent. A timer
//! removes its own entry *before* running its callback, so a reconnect
//! racing a just-fired expiry cannot double-run anything — the callback
//! itself is the source of truth and re-checks room state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct ReconnectTimers {
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ReconnectTimers {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or restart) the countdown for `token`. When it expires,
    /// `on_expire` runs exactly once.
    pub async fn arm<F>(self: &Arc<Self>, token: String, duration: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timers = Arc::clone(self);
        let key = token.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            timers.pending.lock().await.remove(&key);
            on_expire.await;
        });

        if let Some(prev) = self.pending.lock().await.insert(token, handle) {
            prev.abort();
        }
    }

    /// Cancel the countdown for `token` if one is pending. Cancelling a
    /// timer that already expired (and removed itself) is a no-op.
    pub async fn cancel(&self, token: &str) {
        if let Some(handle) = self.pending.lock().await.remove(token) {
            handle.abort();
        }
    }

    pub async fn is_armed(&self, token: &str) -> bool {
        self.pending.lock().await.contains_key(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn settle() {
        // Let spawned timer tasks run to completion under the paused clock.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_fires_once_and_self_removes() {
        let timers = Arc::new(ReconnectTimers::new());
        let fired = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&fired);
        timers
            .arm("tok".into(), Duration::from_secs(30), async move {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(timers.is_armed("tok").await);
        // Poll the spawned task so its sleep registers before the clock moves.
        settle().await;

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed("tok").await);

        // Cancelling after expiry is a no-op, not an error.
        timers.cancel("tok").await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_the_callback() {
        let timers = Arc::new(ReconnectTimers::new());
        let fired = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&fired);
        timers
            .arm("tok".into(), Duration::from_secs(30), async move {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        timers.cancel("tok").await;

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timers.is_armed("tok").await);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_overwrites_the_previous_timer() {
        let timers = Arc::new(ReconnectTimers::new());
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&first);
        timers
            .arm("tok".into(), Duration::from_secs(10), async move {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        settle().await;

        let s = Arc::clone(&second);
        timers
            .arm("tok".into(), Duration::from_secs(30), async move {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        settle().await;

        // Past the first deadline but short of the second: nothing fires.
        tokio::time::advance(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}

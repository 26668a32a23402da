use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::Config;
use crate::relay::StreamRelay;
use crate::upstream::UpstreamClient;

#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Config,
    pub upstream: UpstreamClient,
    pub relay: StreamRelay,
    pub connections: ConnectionRegistry,
    pub rate_limiter: RateLimiter,
}

/// Who is currently connected. Populated on connect, cleared on disconnect;
/// nothing survives a restart.
#[derive(Clone, Debug, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
}

#[derive(Debug)]
struct ConnectionEntry {
    #[allow(dead_code)]
    ip: String,
    connected_at: Instant,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, ip: &str) -> String {
        let connection_id = Uuid::new_v4().to_string();
        self.inner.write().await.insert(
            connection_id.clone(),
            ConnectionEntry {
                ip: ip.to_string(),
                connected_at: Instant::now(),
            },
        );
        connection_id
    }

    pub async fn deregister(&self, connection_id: &str) -> Option<Duration> {
        self.inner
            .write()
            .await
            .remove(connection_id)
            .map(|entry| entry.connected_at.elapsed())
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

/// Fixed-window message counters keyed by hashed client identity.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    inner: Arc<RwLock<RateLimitStore>>,
    max_messages: u32,
    window: Duration,
    cleanup_interval: Duration,
}

#[derive(Debug)]
struct RateLimitStore {
    windows: HashMap<String, WindowEntry>,
    last_cleanup: Instant,
}

#[derive(Debug)]
struct WindowEntry {
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(max_messages: u32, window_secs: u64, cleanup_interval_secs: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RateLimitStore {
                windows: HashMap::new(),
                last_cleanup: Instant::now(),
            })),
            max_messages,
            window: Duration::from_secs(window_secs),
            cleanup_interval: Duration::from_secs(cleanup_interval_secs),
        }
    }

    /// Counts one message against the identity's current window. Returns
    /// false when the window is already full.
    pub async fn check(&self, identity_key: &str) -> bool {
        let now = Instant::now();
        let mut store = self.inner.write().await;
        self.maybe_cleanup_locked(&mut store, now);

        let entry = store
            .windows
            .entry(identity_key.to_string())
            .or_insert(WindowEntry {
                window_start: now,
                count: 0,
            });

        if now
            .checked_duration_since(entry.window_start)
            .unwrap_or_default()
            >= self.window
        {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= self.max_messages {
            return false;
        }
        entry.count += 1;
        true
    }

    pub async fn cleanup_expired(&self, now: Instant) -> usize {
        let mut store = self.inner.write().await;
        let removed = self.cleanup_expired_locked(&mut store, now);
        store.last_cleanup = now;
        removed
    }

    fn maybe_cleanup_locked(&self, store: &mut RateLimitStore, now: Instant) {
        let elapsed = now
            .checked_duration_since(store.last_cleanup)
            .unwrap_or_default();
        if elapsed < self.cleanup_interval {
            return;
        }

        self.cleanup_expired_locked(store, now);
        store.last_cleanup = now;
    }

    fn cleanup_expired_locked(&self, store: &mut RateLimitStore, now: Instant) -> usize {
        let before = store.windows.len();
        store
            .windows
            .retain(|_, entry| !self.is_expired(entry, now));
        before.saturating_sub(store.windows.len())
    }

    fn is_expired(&self, entry: &WindowEntry, now: Instant) -> bool {
        now.checked_duration_since(entry.window_start)
            .unwrap_or_default()
            > self.window
    }
}

static APP_STATE: OnceLock<AppState> = OnceLock::new();

pub fn set_app_state(state: AppState) {
    APP_STATE
        .set(state)
        .expect("global state should only initialize once");
}

pub fn app_state() -> &'static AppState {
    APP_STATE
        .get()
        .expect("application state should be initialized before serving")
}

#[cfg(test)]
mod tests {
    use super::{ConnectionRegistry, RateLimiter, WindowEntry};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn registry_tracks_connect_and_disconnect() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.active_count().await, 0);

        let first = registry.register("203.0.113.7").await;
        let second = registry.register("203.0.113.8").await;
        assert_ne!(first, second);
        assert_eq!(registry.active_count().await, 2);

        assert!(registry.deregister(&first).await.is_some());
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn deregister_of_unknown_connection_is_a_noop() {
        let registry = ConnectionRegistry::new();
        assert!(registry.deregister("missing").await.is_none());
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn rate_limiter_allows_up_to_the_window_maximum() {
        let limiter = RateLimiter::new(3, 60, 120);
        assert!(limiter.check("identity-a").await);
        assert!(limiter.check("identity-a").await);
        assert!(limiter.check("identity-a").await);
        assert!(!limiter.check("identity-a").await);
    }

    #[tokio::test]
    async fn rate_limiter_counts_identities_independently() {
        let limiter = RateLimiter::new(1, 60, 120);
        assert!(limiter.check("identity-a").await);
        assert!(limiter.check("identity-b").await);
        assert!(!limiter.check("identity-a").await);
    }

    #[tokio::test]
    async fn rate_limiter_resets_after_the_window_elapses() {
        let limiter = RateLimiter::new(1, 60, 120);
        assert!(limiter.check("identity-a").await);
        assert!(!limiter.check("identity-a").await);

        {
            let mut store = limiter.inner.write().await;
            let entry = store.windows.get_mut("identity-a").expect("entry");
            entry.window_start = Instant::now() - Duration::from_secs(61);
        }

        assert!(limiter.check("identity-a").await);
    }

    #[tokio::test]
    async fn cleanup_removes_stale_windows_but_keeps_active() {
        let limiter = RateLimiter::new(5, 60, 120);
        let now = Instant::now();

        {
            let mut store = limiter.inner.write().await;
            store.windows.insert(
                "stale".to_string(),
                WindowEntry {
                    window_start: now - Duration::from_secs(120),
                    count: 5,
                },
            );
            store.windows.insert(
                "active".to_string(),
                WindowEntry {
                    window_start: now - Duration::from_secs(30),
                    count: 2,
                },
            );
        }

        let removed = limiter.cleanup_expired(now).await;
        assert_eq!(removed, 1);

        let store = limiter.inner.read().await;
        assert!(!store.windows.contains_key("stale"));
        assert!(store.windows.contains_key("active"));
    }
}

//! Background removal of expired sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::store::SessionStore;

/// Periodically reap sessions whose results have expired.
pub fn spawn_reaper(store: Arc<SessionStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reaped = store.reap_expired(Utc::now()).await;
            debug!(reaped, live = store.len(), "Reaper pass finished");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::session::SessionState;

    #[tokio::test]
    async fn test_reaper_removes_expired_sessions() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            root: Some(tmp.path().join("root")),
            session_ttl_secs: 0,
            ..StorageConfig::default()
        };
        let store = Arc::new(SessionStore::open(&config).await.unwrap());
        let session = store.create_session().await.unwrap();
        store.mark_pending(&session.id).unwrap();

        let handle = spawn_reaper(store.clone(), Duration::from_millis(10));
        for _ in 0..100 {
            if store.state(&session.id) == SessionState::Reaped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        assert_eq!(store.state(&session.id), SessionState::Reaped);
        assert!(!session.dir.exists());
    }
}

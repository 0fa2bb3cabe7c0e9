//! Session directories and their lifecycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use super::models::{Session, SessionId, SessionRecord, SessionState};
use crate::config::StorageConfig;

/// Uploaded scan, as received.
pub const INPUT_FILE: &str = "input.nii.gz";
/// Segmentation result served for download.
pub const OUTPUT_FILE: &str = "segmented_image.nii";

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
}

/// Owns the temp root and every session directory under it.
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    ttl: Duration,
    remove_on_shutdown: bool,
    registry: DashMap<SessionId, SessionRecord>,
}

impl SessionStore {
    /// Create the root directory, optionally clearing leftover sessions.
    /// Entries that are not session directories are left alone.
    pub async fn open(config: &StorageConfig) -> SessionResult<Self> {
        let root = config.root_dir();

        if config.purge_on_start && root.exists() {
            let removed = purge_dir(&root).await?;
            if removed > 0 {
                info!("Removed {} stale session(s) from {}", removed, root.display());
            }
        }

        fs::create_dir_all(&root).await?;
        info!("Session root: {}", root.display());

        Ok(Self {
            root,
            ttl: config.session_ttl(),
            remove_on_shutdown: config.remove_on_shutdown,
            registry: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn input_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(INPUT_FILE)
    }

    pub fn output_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(OUTPUT_FILE)
    }

    /// Allocate a fresh session directory.
    pub async fn create_session(&self) -> SessionResult<Session> {
        let id = SessionId::new();
        fs::create_dir_all(self.session_dir(&id)).await?;
        Ok(self.register(id))
    }

    /// Blocking variant of `create_session` with a caller-chosen id, for
    /// callers already on the blocking pool.
    pub fn create_session_blocking(&self, id: SessionId) -> SessionResult<Session> {
        std::fs::create_dir_all(self.session_dir(&id))?;
        Ok(self.register(id))
    }

    fn register(&self, id: SessionId) -> Session {
        let dir = self.session_dir(&id);
        self.registry.insert(id, SessionRecord::new(dir.clone()));
        debug!(session_id = %id, "Created session directory {}", dir.display());
        Session { id, dir }
    }

    /// Remove a session directory. Missing directories are not an error.
    pub async fn delete_session(&self, id: &SessionId) -> SessionResult<()> {
        let dir = self.session_dir(id);
        self.registry.remove(id);

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(session_id = %id, "Removed session directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Io(e)),
        }
    }

    /// Result written; the session becomes eligible for download and reaping.
    pub fn mark_pending(&self, id: &SessionId) -> SessionResult<()> {
        self.transition(id, SessionState::Pending, |record, now| {
            record.ready_at = Some(now);
        })
    }

    /// Result handed to a client.
    pub fn mark_delivered(&self, id: &SessionId) -> SessionResult<()> {
        self.transition(id, SessionState::Delivered, |record, now| {
            record.delivered_at.get_or_insert(now);
        })
    }

    fn transition(
        &self,
        id: &SessionId,
        next: SessionState,
        update: impl FnOnce(&mut SessionRecord, DateTime<Utc>),
    ) -> SessionResult<()> {
        let mut record = self
            .registry
            .get_mut(id)
            .ok_or(SessionError::NotFound(*id))?;

        if !record.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                id: *id,
                from: record.state,
                to: next,
            });
        }

        record.state = next;
        update(record.value_mut(), Utc::now());
        Ok(())
    }

    /// Current lifecycle state; sessions no longer tracked are `Reaped`.
    pub fn state(&self, id: &SessionId) -> SessionState {
        self.registry
            .get(id)
            .map(|record| record.state)
            .unwrap_or(SessionState::Reaped)
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Remove sessions whose result has outlived the TTL.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));

        let expired: Vec<SessionId> = self
            .registry
            .iter()
            .filter(|entry| {
                let record = entry.value();
                record.state.is_reapable()
                    && record
                        .ready_at
                        .is_some_and(|ready| now.signed_duration_since(ready) >= ttl)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;
        for id in expired {
            match self.delete_session(&id).await {
                Ok(()) => reaped += 1,
                Err(e) => warn!(session_id = %id, "Failed to reap session: {}", e),
            }
        }

        if reaped > 0 {
            info!("Reaped {} expired session(s)", reaped);
        }
        reaped
    }

    /// Remove every session directory, and the root itself once nothing
    /// else lives there, if configured to.
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.registry.clear();
        if !self.remove_on_shutdown {
            return Ok(());
        }

        match purge_dir(&self.root).await {
            Ok(removed) => debug!("Removed {} session(s) at shutdown", removed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SessionError::Io(e)),
        }

        match fs::remove_dir(&self.root).await {
            Ok(()) => info!("Removed session root {}", self.root.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => info!("Keeping session root {}: {}", self.root.display(), e),
        }
        Ok(())
    }
}

/// Remove the session directories under `root`. Anything whose name is not a
/// session id is someone else's and stays.
async fn purge_dir(root: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let is_session = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.parse::<SessionId>().is_ok());
        if !is_session || !entry.file_type().await?.is_dir() {
            debug!("Leaving {} in place", entry.path().display());
            continue;
        }

        let path = entry.path();
        match fs::remove_dir_all(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(root: &Path) -> StorageConfig {
        StorageConfig {
            root: Some(root.join("sessions")),
            session_ttl_secs: 60,
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_session_makes_unique_dirs() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(&config(tmp.path())).await.unwrap();

        let a = store.create_session().await.unwrap();
        let b = store.create_session().await.unwrap();

        assert_ne!(a.id, b.id);
        assert!(a.dir.is_dir());
        assert!(b.dir.is_dir());
        assert_eq!(a.dir, store.session_dir(&a.id));
        assert_eq!(store.state(&a.id), SessionState::Processing);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_session_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(&config(tmp.path())).await.unwrap();

        let session = store.create_session().await.unwrap();
        std::fs::write(store.input_path(&session.id), b"data").unwrap();

        store.delete_session(&session.id).await.unwrap();
        assert!(!session.dir.exists());
        assert_eq!(store.state(&session.id), SessionState::Reaped);

        store.delete_session(&session.id).await.unwrap();
        store.delete_session(&SessionId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(&config(tmp.path())).await.unwrap();
        let session = store.create_session().await.unwrap();

        assert!(matches!(
            store.mark_delivered(&session.id),
            Err(SessionError::InvalidTransition { .. })
        ));

        store.mark_pending(&session.id).unwrap();
        assert_eq!(store.state(&session.id), SessionState::Pending);
        store.mark_delivered(&session.id).unwrap();
        store.mark_delivered(&session.id).unwrap();
        assert_eq!(store.state(&session.id), SessionState::Delivered);

        assert!(matches!(
            store.mark_pending(&SessionId::new()),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reaper_skips_processing_and_fresh_sessions() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(&config(tmp.path())).await.unwrap();

        let processing = store.create_session().await.unwrap();
        let ready = store.create_session().await.unwrap();
        let delivered = store.create_session().await.unwrap();
        store.mark_pending(&ready.id).unwrap();
        store.mark_pending(&delivered.id).unwrap();
        store.mark_delivered(&delivered.id).unwrap();

        assert_eq!(store.reap_expired(Utc::now()).await, 0);

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(store.reap_expired(later).await, 2);

        assert!(processing.dir.exists());
        assert!(!ready.dir.exists());
        assert!(!delivered.dir.exists());
        assert_eq!(store.state(&processing.id), SessionState::Processing);
        assert_eq!(store.state(&ready.id), SessionState::Reaped);
    }

    #[tokio::test]
    async fn test_open_purges_leftover_sessions_only() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        let root = cfg.root_dir();
        let stale = root.join(SessionId::new().to_string());
        std::fs::create_dir_all(stale.join("nested")).unwrap();
        std::fs::write(stale.join(INPUT_FILE), b"old scan").unwrap();
        std::fs::write(root.join("notes.txt"), b"keep me").unwrap();
        std::fs::create_dir_all(root.join("operator-data")).unwrap();
        // A file named like a session is still not a session directory.
        let stray = root.join(SessionId::new().to_string());
        std::fs::write(&stray, b"not a dir").unwrap();

        let store = SessionStore::open(&cfg).await.unwrap();
        assert!(store.root().is_dir());
        assert!(!stale.exists());
        assert_eq!(std::fs::read(root.join("notes.txt")).unwrap(), b"keep me");
        assert!(root.join("operator-data").is_dir());
        assert!(stray.is_file());
    }

    #[tokio::test]
    async fn test_shutdown_removes_root() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(&config(tmp.path())).await.unwrap();
        store.create_session().await.unwrap();

        store.shutdown().await.unwrap();
        assert!(!store.root().exists());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_keeps_foreign_entries() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(&config(tmp.path())).await.unwrap();
        let session = store.create_session().await.unwrap();
        std::fs::write(store.root().join("notes.txt"), b"keep me").unwrap();
        std::fs::create_dir_all(store.root().join("operator-data")).unwrap();

        store.shutdown().await.unwrap();
        assert!(!session.dir.exists());
        assert!(store.root().join("notes.txt").is_file());
        assert!(store.root().join("operator-data").is_dir());
    }

    #[tokio::test]
    async fn test_create_session_blocking_uses_given_id() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::open(&config(tmp.path())).await.unwrap();

        let id = SessionId::new();
        let session = store.create_session_blocking(id).unwrap();
        assert_eq!(session.id, id);
        assert!(session.dir.is_dir());
        assert_eq!(store.state(&id), SessionState::Processing);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_root_when_disabled() {
        let tmp = TempDir::new().unwrap();
        let cfg = StorageConfig {
            remove_on_shutdown: false,
            ..config(tmp.path())
        };
        let store = SessionStore::open(&cfg).await.unwrap();

        store.shutdown().await.unwrap();
        assert!(store.root().exists());
    }
}

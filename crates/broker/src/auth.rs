//! Persisted authentication state, one opaque blob per account.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::channel::AuthStateBlob;
use crate::BrokerError;

/// File-backed store for per-account authentication state.
#[derive(Debug, Clone)]
pub struct AuthStateStore {
    dir: PathBuf,
}

impl AuthStateStore {
    /// Create a store rooted at the given directory. The directory is created
    /// lazily on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, account_id: &str) -> PathBuf {
        self.dir.join(format!("{account_id}.json"))
    }

    /// Load the persisted state for an account, `None` when nothing was
    /// saved yet. A corrupt blob is treated as absent so a stale file cannot
    /// block a reconnect.
    pub async fn load(&self, account_id: &str) -> Result<Option<AuthStateBlob>, BrokerError> {
        let path = self.path_for(account_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_str(&contents) {
            Ok(value) => {
                debug!(account_id, path = %path.display(), "restored auth state");
                Ok(Some(AuthStateBlob(value)))
            }
            Err(err) => {
                warn!(account_id, %err, "discarding unreadable auth state");
                Ok(None)
            }
        }
    }

    /// Persist the state for an account, replacing any prior blob.
    pub async fn save(&self, account_id: &str, blob: &AuthStateBlob) -> Result<(), BrokerError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(account_id);
        let contents = serde_json::to_string_pretty(&blob.0)?;
        tokio::fs::write(&path, contents).await?;
        debug!(account_id, path = %path.display(), "saved auth state");
        Ok(())
    }

    /// Remove the persisted state for an account, if any.
    pub async fn remove(&self, account_id: &str) -> Result<(), BrokerError> {
        let path = self.path_for(account_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// The directory this store writes under.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStateStore::new(dir.path());

        assert!(store.load("acct-1").await.unwrap().is_none());

        let blob = AuthStateBlob(serde_json::json!({"cookies": ["session=abc"]}));
        store.save("acct-1", &blob).await.unwrap();

        let restored = store.load("acct-1").await.unwrap().unwrap();
        assert_eq!(restored, blob);
    }

    #[tokio::test]
    async fn corrupt_blob_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStateStore::new(dir.path());

        tokio::fs::write(dir.path().join("acct-1.json"), "{not json")
            .await
            .unwrap();
        assert!(store.load("acct-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthStateStore::new(dir.path());

        store.remove("never-saved").await.unwrap();

        let blob = AuthStateBlob(serde_json::json!({"token": "t"}));
        store.save("acct-2", &blob).await.unwrap();
        store.remove("acct-2").await.unwrap();
        assert!(store.load("acct-2").await.unwrap().is_none());
    }
}

//! Local persistence of the signed-in session.
//!
//! A restarted process reads the cached session back and asks the identity
//! provider whether it is still honored.

use party_core::identity::Session;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Errors from reading or writing the session cache.
#[derive(Error, Debug)]
pub enum SessionCacheError {
    /// Filesystem failure
    #[error("Session cache I/O error at {path}: {source}")]
    Io {
        /// Cache file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The cache file does not hold a session
    #[error("Session cache is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Where the signed-in session lives between runs.
pub trait SessionCache: Send + Sync {
    /// The cached session, if any.
    ///
    /// # Errors
    ///
    /// - `Io`, `Corrupt`
    fn load(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Session>, SessionCacheError>> + Send + '_>>;

    /// Replace the cached session.
    ///
    /// # Errors
    ///
    /// - `Io`, `Corrupt`
    fn save<'a>(
        &'a self,
        session: &'a Session,
    ) -> Pin<Box<dyn Future<Output = Result<(), SessionCacheError>> + Send + 'a>>;

    /// Forget the cached session. Clearing an empty cache succeeds.
    ///
    /// # Errors
    ///
    /// - `Io`
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<(), SessionCacheError>> + Send + '_>>;
}

/// JSON file on local disk.
///
/// Writes go to a sibling temp file that is renamed over the cache, so a
/// crash mid-write leaves the previous session intact.
#[derive(Debug, Clone)]
pub struct FileSessionCache {
    path: PathBuf,
}

impl FileSessionCache {
    /// Cache stored at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cache file location
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SessionCacheError {
        SessionCacheError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SessionCache for FileSessionCache {
    fn load(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Session>, SessionCacheError>> + Send + '_>> {
        Box::pin(async move {
            let bytes = match tokio::fs::read(&self.path).await {
                Ok(bytes) => bytes,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(error) => return Err(self.io_error(error)),
            };
            Ok(Some(serde_json::from_slice(&bytes)?))
        })
    }

    fn save<'a>(
        &'a self,
        session: &'a Session,
    ) -> Pin<Box<dyn Future<Output = Result<(), SessionCacheError>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = serde_json::to_vec_pretty(session)?;
            let parent = self.path.parent().filter(|parent| !parent.as_os_str().is_empty());
            if let Some(parent) = parent {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|error| self.io_error(error))?;
            }

            let staging = self.path.with_extension("tmp");
            tokio::fs::write(&staging, bytes)
                .await
                .map_err(|error| self.io_error(error))?;
            tokio::fs::rename(&staging, &self.path)
                .await
                .map_err(|error| self.io_error(error))?;

            tracing::debug!(path = %self.path.display(), "Session cached");
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<(), SessionCacheError>> + Send + '_>> {
        Box::pin(async move {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(error) => Err(self.io_error(error)),
            }
        })
    }
}

/// Process-local cache, for tests and for callers that opt out of persistence.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionCache {
    session: Arc<Mutex<Option<Session>>>,
}

impl MemorySessionCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Peek at the cached session
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SessionCache for MemorySessionCache {
    fn load(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Session>, SessionCacheError>> + Send + '_>> {
        let session = self.current();
        Box::pin(async move { Ok(session) })
    }

    fn save<'a>(
        &'a self,
        session: &'a Session,
    ) -> Pin<Box<dyn Future<Output = Result<(), SessionCacheError>> + Send + 'a>> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Box::pin(async { Ok(()) })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<(), SessionCacheError>> + Send + '_>> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use party_core::identity::SessionToken;
    use party_core::model::{Email, UserId};
    use party_core::environment::Clock;
    use party_testing::test_clock;

    fn session() -> Session {
        let issued_at = test_clock().now();
        Session {
            token: SessionToken::new("token-1"),
            uid: UserId::new("uid-1"),
            email: Email::new("ana@example.com"),
            issued_at,
            expires_at: issued_at + chrono::Duration::days(7),
        }
    }

    #[tokio::test]
    async fn test_file_cache_survives_a_new_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let cache = FileSessionCache::new(&path);
        assert!(cache.load().await.unwrap().is_none());
        cache.save(&session()).await.unwrap();

        let reopened = FileSessionCache::new(&path);
        assert_eq!(reopened.load().await.unwrap(), Some(session()));

        reopened.clear().await.unwrap();
        reopened.clear().await.unwrap();
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let result = FileSessionCache::new(&path).load().await;
        assert!(matches!(result, Err(SessionCacheError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_memory_cache() {
        let cache = MemorySessionCache::new();
        cache.save(&session()).await.unwrap();
        assert_eq!(cache.load().await.unwrap(), Some(session()));
        cache.clear().await.unwrap();
        assert!(cache.current().is_none());
    }
}

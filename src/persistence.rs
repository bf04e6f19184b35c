//! Session persistence backends
//!
//! The machine calls [`PersistenceAdapter::load`] once at start-up and
//! [`save`](PersistenceAdapter::save) / [`clear`](PersistenceAdapter::clear)
//! whenever the session changes. Nothing here assumes a storage medium:
//! [`MemoryPersistence`] is the fallback when no durable store is wanted.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::types::PersistedSessionRecord;

/// Directory (under the platform config dir) holding the default session file
const DEFAULT_DIR_NAME: &str = "hasura-auth";
/// File name of the default session file
const DEFAULT_FILE_NAME: &str = "session.json";

/// Pluggable storage for the persisted session record
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Read the stored record, if any
    async fn load(&self) -> Result<Option<PersistedSessionRecord>>;

    /// Store `record`, replacing any previous one
    async fn save(&self, record: &PersistedSessionRecord) -> Result<()>;

    /// Remove the stored record; a no-op when nothing is stored
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl<P: PersistenceAdapter + ?Sized> PersistenceAdapter for Arc<P> {
    async fn load(&self) -> Result<Option<PersistedSessionRecord>> {
        (**self).load().await
    }

    async fn save(&self, record: &PersistedSessionRecord) -> Result<()> {
        (**self).save(record).await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }
}

#[async_trait]
impl PersistenceAdapter for Box<dyn PersistenceAdapter> {
    async fn load(&self) -> Result<Option<PersistedSessionRecord>> {
        (**self).load().await
    }

    async fn save(&self, record: &PersistedSessionRecord) -> Result<()> {
        (**self).save(record).await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }
}

// ============================================================================
// In-Memory Backend
// ============================================================================

/// Process-local storage; the session does not survive a restart
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    record: Mutex<Option<PersistedSessionRecord>>,
}

impl MemoryPersistence {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `record`
    #[must_use]
    pub fn with_record(record: PersistedSessionRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }

    /// Current record, without going through the async trait
    #[must_use]
    pub fn snapshot(&self) -> Option<PersistedSessionRecord> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryPersistence {
    async fn load(&self) -> Result<Option<PersistedSessionRecord>> {
        Ok(self.snapshot())
    }

    async fn save(&self, record: &PersistedSessionRecord) -> Result<()> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

// ============================================================================
// File Backend
// ============================================================================

/// JSON file storage, readable only by the owner on Unix
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl Default for FilePersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl FilePersistence {
    /// Create storage at the default path (platform-specific config directory)
    #[must_use]
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_DIR_NAME);

        Self {
            path: config_dir.join(DEFAULT_FILE_NAME),
        }
    }

    /// Create storage at a custom path
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the storage path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PersistenceAdapter for FilePersistence {
    async fn load(&self) -> Result<Option<PersistedSessionRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn save(&self, record: &PersistedSessionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&self.path, &content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms).await?;
        }

        tracing::trace!(path = %self.path.display(), "Session record written");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

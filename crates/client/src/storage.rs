//! Durable key/value storage shared by every tab of a profile.
//!
//! `StorageArea` is the profile-wide store: string values under fixed keys,
//! optionally backed by one `<key>.json` file per key. Each tab talks to it
//! through a `TabStorage`, which stamps writes with the tab's ID. Writes that
//! change a value fan out as [`StorageEvent`]s to every *other* tab, which is
//! how the cross-tab replicator learns about sibling mutations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use cart_sync_core::TabId;

/// Key of the persisted cart (`{ state: { items } }`).
pub const CART_KEY: &str = "guest_cart";

/// Key of the persisted auth identity.
pub const AUTH_KEY: &str = "auth";

/// Key of the persisted pending-sync marker.
pub const PENDING_KEY: &str = "guest_cart_pending";

/// Capacity of the change-notification channel.
const EVENT_CAPACITY: usize = 64;

/// Errors that can occur when reading or writing durable storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backing file could not be read or written.
    #[error("storage I/O error for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Value could not be serialized.
    #[error("storage serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Key contains characters that cannot name a file.
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

/// A change made by some tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// New value, or `None` if the key was removed.
    pub new_value: Option<String>,
    pub origin: TabId,
}

/// Profile-wide storage shared between tabs.
///
/// Cheap to clone; all clones see the same values.
#[derive(Clone)]
pub struct StorageArea {
    inner: Arc<StorageAreaInner>,
}

struct StorageAreaInner {
    values: Mutex<HashMap<String, String>>,
    dir: Option<PathBuf>,
    events: broadcast::Sender<StorageEvent>,
}

impl StorageArea {
    /// Storage that lives only as long as the process.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_values(HashMap::new(), None)
    }

    /// Open directory-backed storage, loading every `<key>.json` file in it.
    ///
    /// Unreadable files are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the directory cannot be created or listed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        let io_err = |source| StorageError::Io {
            key: dir.display().to_string(),
            source,
        };

        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let mut values = HashMap::new();
        for entry in std::fs::read_dir(&dir).map_err(io_err)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(value) => {
                    values.insert(key.to_string(), value);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable storage file"),
            }
        }

        debug!(dir = %dir.display(), keys = values.len(), "Opened durable storage");
        Ok(Self::with_values(values, Some(dir)))
    }

    fn with_values(values: HashMap<String, String>, dir: Option<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StorageAreaInner {
                values: Mutex::new(values),
                dir,
                events,
            }),
        }
    }

    /// A view of this storage for one tab.
    #[must_use]
    pub fn tab(&self, tab: TabId) -> TabStorage {
        TabStorage {
            area: self.clone(),
            tab,
        }
    }

    /// Directory backing this storage, if any.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.inner.dir.as_deref()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn write(&self, origin: TabId, key: &str, value: Option<String>) -> Result<(), StorageError> {
        validate_key(key)?;

        let mut values = self
            .inner
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if values.get(key) == value.as_ref() {
            return Ok(());
        }

        if let Some(dir) = &self.inner.dir {
            match &value {
                Some(v) => write_file(dir, key, v)?,
                None => remove_file(dir, key)?,
            }
        }

        match &value {
            Some(v) => values.insert(key.to_string(), v.clone()),
            None => values.remove(key),
        };
        drop(values);

        // No receivers is fine: nobody else is listening yet.
        let _ = self.inner.events.send(StorageEvent {
            key: key.to_string(),
            new_value: value,
            origin,
        });
        Ok(())
    }
}

/// One tab's handle on the shared storage.
#[derive(Clone)]
pub struct TabStorage {
    area: StorageArea,
    tab: TabId,
}

impl TabStorage {
    /// The tab this handle writes as.
    #[must_use]
    pub const fn tab_id(&self) -> TabId {
        self.tab
    }

    /// The shared storage behind this handle.
    #[must_use]
    pub const fn area(&self) -> &StorageArea {
        &self.area
    }

    /// Read a raw value.
    #[must_use]
    pub fn get_item(&self, key: &str) -> Option<String> {
        self.area.get(key)
    }

    /// Write a raw value. Sibling tabs are notified if the value changed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the key is invalid or the backing file
    /// cannot be written.
    pub fn set_item(&self, key: &str, value: impl Into<String>) -> Result<(), StorageError> {
        self.area.write(self.tab, key, Some(value.into()))
    }

    /// Remove a value. Sibling tabs are notified if it existed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the key is invalid or the backing file
    /// cannot be removed.
    pub fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.area.write(self.tab, key, None)
    }

    /// Read and deserialize a value. Missing or malformed values yield `None`.
    #[must_use]
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_item(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Ignoring malformed storage value");
                None
            }
        }
    }

    /// Serialize and write a value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if serialization or the write fails.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)?;
        self.set_item(key, raw)
    }

    /// Subscribe to changes made by other tabs.
    #[must_use]
    pub fn subscribe(&self) -> StorageSubscription {
        StorageSubscription {
            rx: self.area.inner.events.subscribe(),
            tab: self.tab,
        }
    }
}

/// Stream of changes made by other tabs.
pub struct StorageSubscription {
    rx: broadcast::Receiver<StorageEvent>,
    tab: TabId,
}

impl StorageSubscription {
    /// Wait for the next change made by another tab.
    ///
    /// Returns `None` once the storage has been dropped. If this subscriber
    /// fell behind, the missed events are skipped and delivery resumes with
    /// the oldest retained one.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.tab => {}
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Storage subscriber lagged, skipping events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// =============================================================================
// File Helpers
// =============================================================================

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// Write via a temp file and rename so readers never see a torn value.
fn write_file(dir: &Path, key: &str, value: &str) -> Result<(), StorageError> {
    let io_err = |source| StorageError::Io {
        key: key.to_string(),
        source,
    };
    let tmp = dir.join(format!("{key}.json.tmp"));
    std::fs::write(&tmp, value).map_err(io_err)?;
    std::fs::rename(&tmp, dir.join(format!("{key}.json"))).map_err(io_err)
}

fn remove_file(dir: &Path, key: &str) -> Result<(), StorageError> {
    match std::fs::remove_file(dir.join(format!("{key}.json"))) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StorageError::Io {
            key: key.to_string(),
            source,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_set_get_remove() {
        let tab = StorageArea::in_memory().tab(TabId::new());
        assert_eq!(tab.get_item(CART_KEY), None);

        tab.set_item(CART_KEY, "{}").unwrap();
        assert_eq!(tab.get_item(CART_KEY).as_deref(), Some("{}"));

        tab.remove_item(CART_KEY).unwrap();
        assert_eq!(tab.get_item(CART_KEY), None);
    }

    #[test]
    fn test_invalid_key_rejected() {
        let tab = StorageArea::in_memory().tab(TabId::new());
        assert!(matches!(
            tab.set_item("../escape", "x"),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_get_json_ignores_malformed() {
        let tab = StorageArea::in_memory().tab(TabId::new());
        tab.set_item(AUTH_KEY, "{not json").unwrap();
        assert_eq!(tab.get_json::<serde_json::Value>(AUTH_KEY), None);
    }

    #[tokio::test]
    async fn test_events_reach_other_tabs_only() {
        let area = StorageArea::in_memory();
        let a = area.tab(TabId::new());
        let b = area.tab(TabId::new());
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.set_item(CART_KEY, "v1").unwrap();

        let event = b_events.recv().await.unwrap();
        assert_eq!(event.key, CART_KEY);
        assert_eq!(event.new_value.as_deref(), Some("v1"));
        assert_eq!(event.origin, a.tab_id());

        let own = tokio::time::timeout(Duration::from_millis(50), a_events.recv()).await;
        assert!(own.is_err(), "a tab must not see its own writes");
    }

    #[tokio::test]
    async fn test_unchanged_value_is_silent() {
        let area = StorageArea::in_memory();
        let a = area.tab(TabId::new());
        let b = area.tab(TabId::new());
        a.set_item(CART_KEY, "same").unwrap();

        let mut b_events = b.subscribe();
        a.set_item(CART_KEY, "same").unwrap();

        let next = tokio::time::timeout(Duration::from_millis(50), b_events.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_removal_is_notified() {
        let area = StorageArea::in_memory();
        let a = area.tab(TabId::new());
        let b = area.tab(TabId::new());
        a.set_item(AUTH_KEY, "x").unwrap();
        let mut b_events = b.subscribe();

        a.remove_item(AUTH_KEY).unwrap();
        let event = b_events.recv().await.unwrap();
        assert_eq!(event.new_value, None);
    }

    #[test]
    fn test_directory_backing_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let tab = StorageArea::open(dir.path()).unwrap().tab(TabId::new());
        tab.set_item(CART_KEY, r#"{"state":{"items":{"P1":1}}}"#).unwrap();
        tab.set_item(AUTH_KEY, "gone soon").unwrap();
        tab.remove_item(AUTH_KEY).unwrap();

        let reopened = StorageArea::open(dir.path()).unwrap().tab(TabId::new());
        assert_eq!(
            reopened.get_item(CART_KEY).as_deref(),
            Some(r#"{"state":{"items":{"P1":1}}}"#)
        );
        assert_eq!(reopened.get_item(AUTH_KEY), None);
        assert!(!dir.path().join("guest_cart.json.tmp").exists());
    }
}

// Credential persistence
// Key/value store shared by every context of the same origin, with change notifications

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

use crate::broadcast::{ContextId, Fanout, Subscription};
use crate::error::StoreError;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const LAST_REFRESH_AT_KEY: &str = "last_refresh_at";

/// Notification that another context changed the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// Changed key, `None` when the whole store was cleared
    pub key: Option<String>,
}

impl StoreChange {
    /// Whether this change can affect the authentication state
    pub fn touches_token(&self) -> bool {
        match self.key.as_deref() {
            None => true,
            Some(key) => key == ACCESS_TOKEN_KEY || key == REFRESH_TOKEN_KEY,
        }
    }
}

/// Durable key/value storage shared across contexts
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Receive changes made through other contexts' views of this store
    fn subscribe(&self) -> Subscription<StoreChange>;
}

struct Backing {
    entries: RwLock<HashMap<String, String>>,
    file: Option<PathBuf>,
    changes: Fanout<StoreChange>,
}

/// Store backed by process memory, optionally mirrored to a JSON file
///
/// Each `attach()` returns a view for another context; writes through one view
/// notify all the others but not the writer.
pub struct LocalCredentialStore {
    context: ContextId,
    backing: Arc<Backing>,
}

impl LocalCredentialStore {
    /// Create an empty in-memory store
    pub fn in_memory() -> Self {
        Self::with_backing(HashMap::new(), None)
    }

    /// Open (or create on first write) a JSON-file backed store
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&contents)?
            }
        } else {
            HashMap::new()
        };

        tracing::debug!(
            "Opened credential store at {} ({} keys)",
            path.display(),
            entries.len()
        );
        Ok(Self::with_backing(entries, Some(path)))
    }

    fn with_backing(entries: HashMap<String, String>, file: Option<PathBuf>) -> Self {
        Self {
            context: Uuid::new_v4(),
            backing: Arc::new(Backing {
                entries: RwLock::new(entries),
                file,
                changes: Fanout::new(),
            }),
        }
    }

    /// Another context's view of the same storage
    pub fn attach(&self) -> Self {
        Self {
            context: Uuid::new_v4(),
            backing: Arc::clone(&self.backing),
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Apply `change` to a copy of the entries; commit and notify only if it changed something
    fn mutate<F>(&self, key: Option<&str>, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut HashMap<String, String>) -> bool,
    {
        let mut entries = self
            .backing
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut next = entries.clone();
        if !change(&mut next) {
            return Ok(());
        }

        if let Some(ref path) = self.backing.file {
            write_file(path, &next)?;
        }
        *entries = next;
        drop(entries);

        self.backing.changes.publish(
            self.context,
            StoreChange {
                key: key.map(str::to_string),
            },
        );
        Ok(())
    }
}

impl CredentialStore for LocalCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self
            .backing
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.mutate(Some(key), |entries| {
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.mutate(Some(key), |entries| entries.remove(key).is_some())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.mutate(None, |entries| {
            let had_entries = !entries.is_empty();
            entries.clear();
            had_entries
        })
    }

    fn subscribe(&self) -> Subscription<StoreChange> {
        self.backing.changes.subscribe(self.context)
    }
}

fn write_file(path: &Path, entries: &HashMap<String, String>) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = serde_json::to_string_pretty(entries)?;
    std::fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// The persisted subset of a session
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// Read the record; `None` when no access token is stored
    pub fn load(store: &dyn CredentialStore) -> Result<Option<Self>, StoreError> {
        let access_token = match store.get(ACCESS_TOKEN_KEY)? {
            Some(token) => token,
            None => return Ok(None),
        };

        let last_refresh_at = store
            .get(LAST_REFRESH_AT_KEY)?
            .and_then(|raw| match DateTime::parse_from_rfc3339(&raw) {
                Ok(dt) => Some(dt.with_timezone(&Utc)),
                Err(e) => {
                    tracing::warn!("Ignoring unparseable {}: {}", LAST_REFRESH_AT_KEY, e);
                    None
                }
            });

        Ok(Some(Self {
            access_token,
            refresh_token: store.get(REFRESH_TOKEN_KEY)?,
            last_refresh_at,
        }))
    }

    /// Write the record
    ///
    /// The access token is written last: other contexts resync on its change
    /// and must see the rest of the record already in place.
    pub fn persist(&self, store: &dyn CredentialStore) -> Result<(), StoreError> {
        match self.refresh_token {
            Some(ref refresh_token) => store.set(REFRESH_TOKEN_KEY, refresh_token)?,
            None => store.remove(REFRESH_TOKEN_KEY)?,
        }
        match self.last_refresh_at {
            Some(at) => store.set(LAST_REFRESH_AT_KEY, &at.to_rfc3339())?,
            None => store.remove(LAST_REFRESH_AT_KEY)?,
        }
        store.set(ACCESS_TOKEN_KEY, &self.access_token)
    }
}

/*
[INPUT]:  Authenticated identity, backend credential and a storage location
[OUTPUT]: Session with TTL checks and persisted SessionRecord (file or memory)
[POS]:    Auth layer - session lifetime and persistence
[UPDATE]: When the persisted record layout or TTL policy changes
*/

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use super::remote::RemoteBinding;
use crate::http::Result;
use crate::types::{Identity, PublicKey, SigningMethod};

pub const DEFAULT_SESSION_FILE: &str = ".nostr-gateway/session.json";

pub fn default_session_ttl() -> TimeDelta {
    TimeDelta::hours(24)
}

/// Live session owned by the identity manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub established_at: DateTime<Utc>,
    pub ttl: TimeDelta,
}

impl Session {
    pub fn new(identity: Identity, ttl: TimeDelta) -> Self {
        Self {
            identity,
            established_at: Utc::now(),
            ttl,
        }
    }

    pub fn from_record(record: &SessionRecord, ttl: TimeDelta) -> Self {
        Self {
            identity: Identity {
                public_key: record.public_key,
                display_id: record.display_id.clone(),
                signing_method: record.signing_method,
            },
            established_at: record.established_at,
            ttl,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.established_at + self.ttl
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.established_at > self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn to_record(&self, credential: Option<SessionCredential>) -> SessionRecord {
        SessionRecord {
            display_id: self.identity.display_id.clone(),
            public_key: self.identity.public_key,
            signing_method: self.identity.signing_method,
            established_at: self.established_at,
            credential,
        }
    }
}

/// Backend material stored next to the session so it can be rebuilt on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionCredential {
    LocalKey { secret_key: String },
    RemoteSigner(RemoteBinding),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub display_id: String,
    pub public_key: PublicKey,
    pub signing_method: SigningMethod,
    pub established_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<SessionCredential>,
}

/// Persistence seam for the session record.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<SessionRecord>>;

    fn save(&self, record: &SessionRecord) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// JSON file store, written atomically with owner-only permissions
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileSessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_FILE)
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<SessionRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "discarding unreadable session file");
                Ok(None)
            }
        }
    }

    fn save(&self, record: &SessionRecord) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }

        let mut file = NamedTempFile::new_in(&dir)?;
        file.write_all(serde_json::to_string_pretty(record)?.as_bytes())?;
        file.flush()?;
        let mut perms = file.as_file().metadata()?.permissions();
        perms.set_mode(0o600);
        file.as_file().set_permissions(perms)?;
        file.persist(&self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral runs; counts loads.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<SessionRecord>>,
    loads: AtomicUsize,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: SessionRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> Option<SessionRecord> {
        match self.record.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn set(&self, value: Option<SessionRecord>) {
        match self.record.lock() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<SessionRecord>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.current())
    }

    fn save(&self, record: &SessionRecord) -> Result<()> {
        self.set(Some(record.clone()));
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.set(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Keys;

    fn identity() -> Identity {
        Identity::new(Keys::generate().public_key(), SigningMethod::LocalKey)
    }

    #[test]
    fn test_expiry_boundary() {
        let mut session = Session::new(identity(), default_session_ttl());
        let now = Utc::now();
        session.established_at = now - TimeDelta::hours(24);
        assert!(!session.is_expired_at(now));
        assert!(session.is_expired_at(now + TimeDelta::seconds(1)));

        session.established_at = now - TimeDelta::hours(25);
        assert!(session.is_expired_at(now));
    }

    #[test]
    fn test_file_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("nested").join("session.json"));
        assert!(store.load().unwrap().is_none());

        let keys = Keys::generate();
        let session = Session::new(identity(), default_session_ttl());
        let record = session.to_record(Some(SessionCredential::LocalKey {
            secret_key: keys.secret_key_hex(),
        }));
        store.save(&record).unwrap();

        assert_eq!(store.load().unwrap(), Some(record));
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(store.clear().is_ok());
    }

    #[test]
    fn test_corrupted_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "{not json").unwrap();
        let store = FileSessionStore::new(&path);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_record_json_shape() {
        let record = Session::new(identity(), default_session_ttl()).to_record(None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["signing_method"], "local_key");
        assert!(json.get("credential").is_none());
        assert!(json["display_id"].as_str().unwrap().starts_with("npub1"));
    }

    #[test]
    fn test_memory_store_counts_loads() {
        let store = MemorySessionStore::new();
        assert!(store.load().unwrap().is_none());
        assert!(store.load().unwrap().is_none());
        assert_eq!(store.load_count(), 2);
    }
}

//! Session and trace identity
//!
//! The [`IdentityStore`] owns the session id (stable for a browsing session,
//! persisted through an optional [`SessionStorage`]) and the current trace
//! id (fresh for every outbound call). It is an explicit context object:
//! construct one, wrap it in an `Arc` and hand it to the interceptor.
//!
//! Ids look like `session-1714564800000-k3j9x0a2b` and
//! `trace-1714564800123-0pq8z7w1m`: a kind prefix, the epoch milliseconds at
//! creation and a random base-36 suffix.

use crate::config::{SessionSettings, StorageMode};
use crate::storage::{FileStorage, MemoryStorage, SessionStorage};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Storage key for the persisted session id
pub const SESSION_STORAGE_KEY: &str = "calltrace.session_id";

const SESSION_PREFIX: &str = "session";
const TRACE_PREFIX: &str = "trace";
const SUFFIX_LEN: usize = 9;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate an id of the form `<prefix>-<epochMillis>-<random36>`
pub fn generate_id(prefix: &str) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        Utc::now().timestamp_millis(),
        random_suffix()
    )
}

fn random_suffix() -> String {
    let mut n = uuid::Uuid::new_v4().as_u128();
    let mut out = Vec::with_capacity(SUFFIX_LEN);
    for _ in 0..SUFFIX_LEN {
        out.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    // only ASCII digits and lowercase letters were pushed
    String::from_utf8(out).unwrap_or_default()
}

/// Extract the creation time (epoch millis) embedded in an id
pub fn embedded_timestamp(id: &str) -> Option<i64> {
    let mut parts = id.splitn(3, '-');
    let _prefix = parts.next()?;
    let millis = parts.next()?.parse::<i64>().ok()?;
    parts.next()?;
    Some(millis)
}

/// Snapshot of the identity state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub session_id: String,
    pub current_trace_id: String,
    pub session_age_ms: u64,
    pub is_valid: bool,
}

#[derive(Debug, Default)]
struct IdentityState {
    session_id: Option<String>,
    trace_id: Option<String>,
}

/// Owner of the session id and current trace id
pub struct IdentityStore {
    state: RwLock<IdentityState>,
    storage: Option<Box<dyn SessionStorage>>,
}

impl IdentityStore {
    /// Create a store backed by the given storage
    pub fn new(storage: Box<dyn SessionStorage>) -> Self {
        Self {
            state: RwLock::new(IdentityState::default()),
            storage: Some(storage),
        }
    }

    /// Create a store that keeps everything in process memory
    pub fn ephemeral() -> Self {
        Self {
            state: RwLock::new(IdentityState::default()),
            storage: None,
        }
    }

    /// Create a store from the `[session]` configuration section
    pub fn from_settings(settings: &SessionSettings) -> Self {
        match settings.storage {
            StorageMode::None => Self::ephemeral(),
            StorageMode::Memory => Self::new(Box::new(MemoryStorage::new())),
            StorageMode::File => {
                let path = settings
                    .path
                    .as_ref()
                    .map(PathBuf::from)
                    .or_else(FileStorage::default_path);
                match path {
                    Some(path) => {
                        debug!("Persisting session id to {}", path.display());
                        Self::new(Box::new(FileStorage::new(path)))
                    }
                    None => {
                        warn!("No config directory for session storage, session ids will not persist");
                        Self::ephemeral()
                    }
                }
            }
        }
    }

    /// Whether a persistent backend is attached
    pub fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    /// Current session id, created (and persisted) on first access
    pub fn session_id(&self) -> String {
        if let Some(id) = self.state.read().session_id.clone() {
            return id;
        }

        let mut state = self.state.write();
        // another caller may have won the race
        if let Some(id) = state.session_id.clone() {
            return id;
        }

        let id = match self.load_persisted() {
            Some(id) => {
                debug!("Restored session id {}", id);
                id
            }
            None => {
                let id = generate_id(SESSION_PREFIX);
                self.persist(&id);
                id
            }
        };
        state.session_id = Some(id.clone());
        id
    }

    /// Generate and store a new current trace id
    pub fn new_trace_id(&self) -> String {
        let id = generate_id(TRACE_PREFIX);
        self.state.write().trace_id = Some(id.clone());
        id
    }

    /// Current trace id, generated if none exists yet
    pub fn current_trace_id(&self) -> String {
        if let Some(id) = self.state.read().trace_id.clone() {
            return id;
        }
        self.new_trace_id()
    }

    /// Adopt a caller-supplied trace id (e.g. propagated by a server)
    pub fn set_trace_id(&self, id: impl Into<String>) {
        let id = id.into();
        if id.trim().is_empty() {
            warn!("Ignoring empty trace id override");
            return;
        }
        self.state.write().trace_id = Some(id);
    }

    /// Start a new session; also starts a new trace
    pub fn regenerate_session(&self) -> String {
        let previous = self.state.read().session_id.clone();

        let mut id = generate_id(SESSION_PREFIX);
        // must differ from the session it replaces
        while previous.as_deref() == Some(id.as_str()) {
            id = generate_id(SESSION_PREFIX);
        }

        self.persist(&id);
        {
            let mut state = self.state.write();
            state.session_id = Some(id.clone());
            state.trace_id = Some(generate_id(TRACE_PREFIX));
        }
        debug!("Regenerated session id {}", id);
        id
    }

    /// Drop the persisted session and immediately create fresh ids
    pub fn clear_session(&self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.remove(SESSION_STORAGE_KEY) {
                warn!("Failed to clear persisted session id: {}", e);
            }
        }
        self.regenerate_session();
    }

    pub fn is_valid(&self) -> bool {
        self.state
            .read()
            .session_id
            .as_deref()
            .map(|id| !id.is_empty())
            .unwrap_or(false)
    }

    /// Snapshot of the current identity
    pub fn info(&self) -> IdentityInfo {
        let session_id = self.session_id();
        let current_trace_id = self.current_trace_id();
        let session_age_ms = embedded_timestamp(&session_id)
            .map(|created| (Utc::now().timestamp_millis() - created).max(0) as u64)
            .unwrap_or(0);

        IdentityInfo {
            is_valid: !session_id.is_empty(),
            session_id,
            current_trace_id,
            session_age_ms,
        }
    }

    fn load_persisted(&self) -> Option<String> {
        let storage = self.storage.as_ref()?;
        match storage.get(SESSION_STORAGE_KEY) {
            Ok(Some(id)) if !id.trim().is_empty() => Some(id),
            Ok(_) => None,
            Err(e) => {
                warn!("Session storage unavailable, using in-memory id: {}", e);
                None
            }
        }
    }

    fn persist(&self, id: &str) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.set(SESSION_STORAGE_KEY, id) {
                warn!("Failed to persist session id, keeping it in memory: {}", e);
            }
        }
    }
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::ephemeral()
    }
}

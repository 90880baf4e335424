//! Persistence bridge.
//!
//! A registry's state is one opaque blob per registry, written at shutdown and
//! read at start. Reading never fails from the caller's point of view: a
//! missing, unreadable, corrupt, or version-mismatched blob yields an empty
//! state and a log line. Write failures are returned so the registry can log
//! them; they never abort shutdown.
//!
//! ## File Layout
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "checksum": "<sha256 of the canonical payload bytes>",
//!   "payload": { "units": [ { "unit": "...", "contents": { ... } } ] }
//! }
//! ```
//!
//! Files are replaced atomically (temp file + rename).

use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::UnitId;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Errors
// ============================================================================

/// Errors reading or writing persisted registry state.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed state: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported schema version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("checksum mismatch in {path}")]
    ChecksumMismatch { path: PathBuf },
}

pub type PersistResult<T> = Result<T, PersistError>;

// ============================================================================
// State Shapes
// ============================================================================

/// Persisted contents of a whole registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryState<T> {
    pub units: Vec<UnitState<T>>,
}

impl<T> Default for RegistryState<T> {
    fn default() -> Self {
        RegistryState { units: Vec::new() }
    }
}

impl<T> RegistryState<T> {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Persisted contents of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitState<T> {
    pub unit: UnitId,
    pub contents: T,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    schema_version: u32,
    checksum: String,
    payload: serde_json::Value,
}

// ============================================================================
// Store Contract
// ============================================================================

/// Durable load/save of one registry's state.
pub trait StateStore<T>: Send + Sync {
    /// The stored state, or an empty state on any failure.
    fn load(&self) -> RegistryState<T>;

    fn save(&self, state: &RegistryState<T>) -> PersistResult<()>;
}

/// JSON file store with checksum and atomic replacement.
#[derive(Debug)]
pub struct FileStateStore<T> {
    path: PathBuf,
    persist: bool,
    _contents: PhantomData<fn() -> T>,
}

impl<T> FileStateStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStateStore {
            path: path.into(),
            persist: true,
            _contents: PhantomData,
        }
    }

    /// With persistence disabled, `save` deletes the file and `load` is empty.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn persists(&self) -> bool {
        self.persist
    }

    /// Strict read. A missing file is an empty state; anything else that goes
    /// wrong is an error.
    pub fn try_load(&self) -> PersistResult<RegistryState<T>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RegistryState::default()),
            Err(source) => {
                return Err(PersistError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        decode(&bytes, &self.path)
    }
}

impl<T> StateStore<T> for FileStateStore<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> RegistryState<T> {
        if !self.persist {
            debug!(path = %self.path.display(), "persistence disabled, starting empty");
            return RegistryState::default();
        }
        match self.try_load() {
            Ok(state) => {
                info!(path = %self.path.display(), units = state.units.len(), "loaded persisted state");
                state
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding unreadable state");
                RegistryState::default()
            }
        }
    }

    fn save(&self, state: &RegistryState<T>) -> PersistResult<()> {
        if !self.persist {
            return match fs::remove_file(&self.path) {
                Ok(()) => {
                    debug!(path = %self.path.display(), "persistence disabled, removed state file");
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(PersistError::Io {
                    path: self.path.clone(),
                    source,
                }),
            };
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| PersistError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let bytes = encode(state)?;
        atomic_write(&self.path, &bytes).map_err(|source| PersistError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), units = state.units.len(), "saved state");
        Ok(())
    }
}

/// In-memory store; keeps the last saved state.
#[derive(Debug)]
pub struct MemoryStateStore<T> {
    saved: Mutex<Option<RegistryState<T>>>,
}

impl<T> Default for MemoryStateStore<T> {
    fn default() -> Self {
        MemoryStateStore {
            saved: Mutex::new(None),
        }
    }
}

impl<T: Clone> MemoryStateStore<T> {
    pub fn new() -> Self {
        MemoryStateStore::default()
    }

    /// Seed the state returned by the next `load`.
    pub fn with_state(state: RegistryState<T>) -> Self {
        MemoryStateStore {
            saved: Mutex::new(Some(state)),
        }
    }

    pub fn saved(&self) -> Option<RegistryState<T>> {
        self.saved.lock().clone()
    }
}

impl<T: Clone + Send> StateStore<T> for MemoryStateStore<T> {
    fn load(&self) -> RegistryState<T> {
        self.saved.lock().clone().unwrap_or_default()
    }

    fn save(&self, state: &RegistryState<T>) -> PersistResult<()> {
        *self.saved.lock() = Some(state.clone());
        Ok(())
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn checksum(payload: &serde_json::Value) -> PersistResult<String> {
    let canonical = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Serialize a state into the enveloped on-disk form.
pub fn encode<T: Serialize>(state: &RegistryState<T>) -> PersistResult<Vec<u8>> {
    let payload = serde_json::to_value(state)?;
    let envelope = Envelope {
        schema_version: SCHEMA_VERSION,
        checksum: checksum(&payload)?,
        payload,
    };
    Ok(serde_json::to_vec_pretty(&envelope)?)
}

/// Parse and verify the enveloped on-disk form. `path` is only used in errors.
pub fn decode<T: DeserializeOwned>(bytes: &[u8], path: &Path) -> PersistResult<RegistryState<T>> {
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    if envelope.schema_version != SCHEMA_VERSION {
        return Err(PersistError::VersionMismatch {
            found: envelope.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    if checksum(&envelope.payload)? != envelope.checksum {
        return Err(PersistError::ChecksumMismatch {
            path: path.to_path_buf(),
        });
    }
    Ok(serde_json::from_value(envelope.payload)?)
}

/// Write via a sibling temp file and rename, so readers never see a torn file.
fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        nanos
    ));
    fs::write(&temp_path, content)?;
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

// ABOUTME: Durable authentication material for the protocol session
// ABOUTME: File-backed store (atomic replace, wholesale clear) and an in-memory store for tests

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

const CREDS_FILE: &str = "creds.json";

/// Opaque credentials blob plus the markers the core cares about
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthCredentials {
    /// Paired account identity, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Monotonic revision, bumped by the protocol library on each change
    #[serde(default)]
    pub version: u64,
    /// Library-owned key material; never inspected by the core
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AuthCredentials {
    /// Fresh state for an unpaired device
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.identity.is_none() && self.data.is_null()
    }
}

// Custom Debug impl to redact key material
impl fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredentials")
            .field("identity", &self.identity)
            .field("version", &self.version)
            .field("data", &if self.data.is_null() { "<empty>" } else { "[REDACTED]" })
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Load/save/clear bridge between the session and durable storage
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Existing credentials, or empty state when nothing is stored
    async fn load(&self) -> Result<AuthCredentials>;

    /// Persist a credentials change. Must complete before the session proceeds.
    async fn save(&self, credentials: &AuthCredentials) -> Result<()>;

    /// Delete everything stored for this identity
    async fn clear(&self) -> Result<()>;
}

// =============================================================================
// File store
// =============================================================================

/// Credentials kept as a small fileset under one session directory
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store an auxiliary keyed blob next to the main credentials
    pub async fn save_key(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        validate_key(key)?;
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_atomic(&format!("{}.json", key), &bytes).await
    }

    /// Read an auxiliary keyed blob
    pub async fn load_key(&self, key: &str) -> Result<Option<serde_json::Value>> {
        validate_key(key)?;
        let path = self.dir.join(format!("{}.json", key));
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let target = self.dir.join(file_name);
        let tmp = self.dir.join(format!(".{}.tmp", file_name));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .with_context(|| format!("Failed to replace {}", target.display()))?;
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key == "creds"
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!("Invalid credential key: {:?}", key);
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<AuthCredentials> {
        let path = self.dir.join(CREDS_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let creds: AuthCredentials = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to parse {}", path.display()))?;
                tracing::debug!(
                    path = %path.display(),
                    identity = ?creds.identity,
                    version = creds.version,
                    "Loaded stored credentials"
                );
                Ok(creds)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(dir = %self.dir.display(), "No stored credentials, starting unpaired");
                Ok(AuthCredentials::empty())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn save(&self, credentials: &AuthCredentials) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(credentials)?;
        self.write_atomic(CREDS_FILE, &bytes).await?;
        tracing::debug!(version = credentials.version, "Credentials saved");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                tracing::warn!(dir = %self.dir.display(), "Session directory removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.dir.display())),
        }
    }
}

// =============================================================================
// Memory store
// =============================================================================

/// In-memory credential store. Data is lost on restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    current: Mutex<Option<AuthCredentials>>,
    saves: AtomicUsize,
    clears: AtomicUsize,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with credentials
    pub fn with_credentials(credentials: AuthCredentials) -> Self {
        Self {
            current: Mutex::new(Some(credentials)),
            ..Self::default()
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub async fn current(&self) -> Option<AuthCredentials> {
        self.current.lock().await.clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<AuthCredentials> {
        Ok(self.current.lock().await.clone().unwrap_or_default())
    }

    async fn save(&self, credentials: &AuthCredentials) -> Result<()> {
        *self.current.lock().await = Some(credentials.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.current.lock().await = None;
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

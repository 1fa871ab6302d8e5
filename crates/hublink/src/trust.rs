//! Trusted certificate store.
//!
//! A persisted mapping from pin key to an accepted certificate, injected into
//! the engine at construction — the engine holds no ambient trust state. The
//! store is consulted before completing a TLS-suspect connection and written
//! only on explicit caller acceptance.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use bytes::Bytes;

/// Pin-key → accepted certificate store.
pub trait TrustStore: Send + 'static {
    /// Certificate previously accepted for this key, if any.
    fn load(&self, key: &str) -> Option<Bytes>;

    /// Persist an accepted certificate for this key, replacing any prior one.
    fn save(&mut self, key: &str, pem: &[u8]) -> io::Result<()>;
}

/// In-memory store. Nothing survives the process; meant for tests and for
/// callers that opt out of persistence.
#[derive(Debug, Default)]
pub struct MemoryTrustStore {
    entries: HashMap<String, Bytes>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn load(&self, key: &str) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    fn save(&mut self, key: &str, pem: &[u8]) -> io::Result<()> {
        self.entries
            .insert(key.to_owned(), Bytes::copy_from_slice(pem));
        Ok(())
    }
}

/// One PEM file per pin key under a directory.
///
/// Keys are flattened to a single filename component, so distinct keys that
/// sanitize identically would collide; server identifiers are UUIDs in
/// practice, which survive sanitization unchanged.
#[derive(Debug)]
pub struct FileTrustStore {
    dir: PathBuf,
}

impl FileTrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.pem"))
    }
}

impl TrustStore for FileTrustStore {
    fn load(&self, key: &str) -> Option<Bytes> {
        match std::fs::read(self.path_for(key)) {
            Ok(pem) => Some(Bytes::from(pem)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read trust-store entry");
                None
            }
        }
    }

    fn save(&mut self, key: &str, pem: &[u8]) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path_for(key), pem)
    }
}

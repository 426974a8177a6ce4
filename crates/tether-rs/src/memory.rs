//! External key-value memory.
//!
//! Summarization compounds loss; facts that must outlive it go through a
//! [`MemoryStore`]. The runtime reads configured keys at session start
//! (injected as pinned documents) and writes the session's summary, or its
//! last answer, at session end. Store failures never abort a session.
//!
//! Two stores are provided: [`InMemoryStore`] for tests and embedding, and
//! [`FileMemoryStore`], one Markdown file per key under a directory.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use crate::error::MemoryError;

/// Boxed future returned by [`MemoryStore`] operations.
pub type MemoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MemoryError>> + Send + 'a>>;

/// A simple keyed store.
pub trait MemoryStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> MemoryFuture<'a, Option<String>>;
    fn put<'a>(&'a self, key: &'a str, value: String) -> MemoryFuture<'a, ()>;
}

// ── In-memory ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry (builder pattern).
    pub fn with_entry(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.lock().insert(key.into(), value.into());
        self
    }

    /// Synchronous read, for inspection.
    pub fn snapshot(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryStore for InMemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> MemoryFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.lock().get(key).cloned()) })
    }

    fn put<'a>(&'a self, key: &'a str, value: String) -> MemoryFuture<'a, ()> {
        Box::pin(async move {
            self.lock().insert(key.to_string(), value);
            Ok(())
        })
    }
}

// ── File-backed ────────────────────────────────────────────────────

/// One `<key>.md` file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileMemoryStore {
    dir: PathBuf,
}

impl FileMemoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for `key`. Keys are restricted to a safe character set so they
    /// cannot escape the directory.
    fn path_for(&self, key: &str) -> Result<PathBuf, MemoryError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.starts_with('.');
        if !valid {
            return Err(MemoryError::Store(format!("invalid memory key '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.md")))
    }
}

impl MemoryStore for FileMemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> MemoryFuture<'a, Option<String>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => Ok(Some(content)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(MemoryError::Store(format!(
                    "failed to read {}: {e}",
                    path.display()
                ))),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: String) -> MemoryFuture<'a, ()> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
                MemoryError::Store(format!("failed to create {}: {e}", self.dir.display()))
            })?;
            tokio::fs::write(&path, value)
                .await
                .map_err(|e| MemoryError::Store(format!("failed to write {}: {e}", path.display())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_round_trip() {
        let store = InMemoryStore::new().with_entry("facts", "the sky is blue");
        assert_eq!(
            store.get("facts").await.unwrap().as_deref(),
            Some("the sky is blue")
        );
        assert_eq!(store.get("missing").await.unwrap(), None);
        store.put("notes", "n".into()).await.unwrap();
        assert_eq!(store.snapshot("notes").as_deref(), Some("n"));
    }

    #[tokio::test]
    async fn file_store_reads_and_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryStore::new(dir.path().join("memory"));
        assert_eq!(store.get("summary").await.unwrap(), None);
        store.put("summary", "earlier work".into()).await.unwrap();
        assert_eq!(
            store.get("summary").await.unwrap().as_deref(),
            Some("earlier work")
        );
        assert!(dir.path().join("memory/summary.md").exists());
    }

    #[tokio::test]
    async fn file_store_rejects_path_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.put(".hidden", "x".into()).await.is_err());
        assert!(store.put("", "x".into()).await.is_err());
    }
}

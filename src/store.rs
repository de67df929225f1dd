use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::fs as async_fs;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::agent::AgentError;

/// A persisted collection of domain records. Always written as a complete
/// snapshot; readers tolerate unknown fields inside records.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Document<T> {
    #[serde(default)]
    pub records: Vec<T>,
    #[serde(default)]
    pub last_updated: String,
}

impl<T> Document<T> {
    pub fn empty() -> Self {
        Self { records: Vec::new(), last_updated: now_iso() }
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    Appended,
    Replaced,
}

/// Whole-snapshot JSON document store. Each operation is a full
/// load-modify-rewrite guarded by a per-path mutex, so writers within this
/// process never interleave on one document. Writers in other processes
/// are NOT coordinated: their read-modify-write cycles can overlap ours
/// and the last full snapshot written wins.
#[derive(Default)]
pub struct DocStore {
    locks: StdMutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl DocStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Result<Arc<AsyncMutex<()>>, AgentError> {
        let mut locks = self.locks.lock().map_err(|e| AgentError::Store(e.to_string()))?;
        Ok(locks.entry(path.to_path_buf()).or_default().clone())
    }

    /// Load-or-create: an absent document is synthesized empty and
    /// persisted before returning, so a second load sees the same document.
    /// Unreadable content is a `Corrupt` error, never a silent empty.
    pub async fn load<T>(&self, path: &Path) -> Result<Document<T>, AgentError>
    where
        T: Serialize + DeserializeOwned,
    {
        let guard = self.lock_for(path)?;
        let _held = guard.lock().await;
        self.read_or_create(path).await
    }

    /// Replace the record matching `record` on `key_fields`, or append if
    /// none matches. Matching is exact equality across the named fields.
    pub async fn upsert<T>(
        &self,
        path: &Path,
        record: T,
        key_fields: &[&str],
    ) -> Result<UpsertOutcome, AgentError>
    where
        T: Serialize + DeserializeOwned,
    {
        let guard = self.lock_for(path)?;
        let _held = guard.lock().await;
        let mut doc: Document<T> = self.read_or_create(path).await?;
        let key = natural_key(&record, key_fields)?;
        let mut found = None;
        for (i, existing) in doc.records.iter().enumerate() {
            if natural_key(existing, key_fields)? == key {
                found = Some(i);
                break;
            }
        }
        let outcome = match found {
            Some(i) => {
                doc.records[i] = record;
                UpsertOutcome::Replaced
            }
            None => {
                doc.records.push(record);
                UpsertOutcome::Appended
            }
        };
        doc.last_updated = now_iso();
        self.write_atomic(path, &doc).await?;
        debug!(path = %path.display(), ?outcome, "upsert");
        Ok(outcome)
    }

    /// Unconditional append, for true logs where duplicates are expected.
    pub async fn append<T>(&self, path: &Path, record: T) -> Result<(), AgentError>
    where
        T: Serialize + DeserializeOwned,
    {
        let guard = self.lock_for(path)?;
        let _held = guard.lock().await;
        let mut doc: Document<T> = self.read_or_create(path).await?;
        doc.records.push(record);
        doc.last_updated = now_iso();
        self.write_atomic(path, &doc).await
    }

    /// Load and filter in memory; record counts stay small enough that no
    /// indexing is worth having.
    pub async fn query<T, F>(&self, path: &Path, predicate: F) -> Result<Vec<T>, AgentError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let doc = self.load(path).await?;
        Ok(doc.records.into_iter().filter(|r| predicate(r)).collect())
    }

    /// Rewrite the whole document, refreshing its timestamp. This is the
    /// primitive under `upsert`; callers doing field-level edits load,
    /// mutate, and save.
    pub async fn save<T>(&self, path: &Path, mut doc: Document<T>) -> Result<(), AgentError>
    where
        T: Serialize,
    {
        let guard = self.lock_for(path)?;
        let _held = guard.lock().await;
        doc.last_updated = now_iso();
        self.write_atomic(path, &doc).await
    }

    async fn read_or_create<T>(&self, path: &Path) -> Result<Document<T>, AgentError>
    where
        T: Serialize + DeserializeOwned,
    {
        match async_fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| AgentError::Corrupt {
                path: path.display().to_string(),
                detail: e.to_string(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let doc = Document::empty();
                self.write_atomic(path, &doc).await?;
                Ok(doc)
            }
            Err(err) => Err(AgentError::Store(format!("read {}: {}", path.display(), err))),
        }
    }

    /// Temp file in the same directory, then rename: the document on disk
    /// is either the old snapshot or the new one, never a partial write.
    async fn write_atomic<T: Serialize>(&self, path: &Path, doc: &Document<T>) -> Result<(), AgentError> {
        let body =
            serde_json::to_vec_pretty(doc).map_err(|e| AgentError::Store(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                async_fs::create_dir_all(parent)
                    .await
                    .map_err(|e| AgentError::Store(format!("create_dir {}: {}", parent.display(), e)))?;
            }
        }
        let tmp = tmp_path(path);
        async_fs::write(&tmp, &body)
            .await
            .map_err(|e| AgentError::Store(format!("write {}: {}", tmp.display(), e)))?;
        async_fs::rename(&tmp, path)
            .await
            .map_err(|e| AgentError::Store(format!("rename {}: {}", path.display(), e)))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn natural_key<T: Serialize>(record: &T, fields: &[&str]) -> Result<Vec<Value>, AgentError> {
    let value = serde_json::to_value(record).map_err(|e| AgentError::Store(e.to_string()))?;
    Ok(fields.iter().map(|f| value.get(*f).cloned().unwrap_or(Value::Null)).collect())
}

// ========================= CSV Log =========================

/// Append-only tabular log. The header row is written exactly once, when
/// the file is created; every append after that is one record row.
pub struct CsvLog {
    path: PathBuf,
    header: Vec<String>,
}

impl CsvLog {
    pub fn new<P: AsRef<Path>>(path: P, header: &[&str]) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            header: header.iter().map(|h| h.to_string()).collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: &[String]) -> Result<(), AgentError> {
        let exists = self.path.exists();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AgentError::Store(format!("create_dir {}: {}", parent.display(), e)))?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AgentError::Store(format!("open {}: {}", self.path.display(), e)))?;
        let mut writer = csv::Writer::from_writer(file);
        if !exists {
            writer
                .write_record(&self.header)
                .map_err(|e| AgentError::Store(e.to_string()))?;
        }
        writer.write_record(row).map_err(|e| AgentError::Store(e.to_string()))?;
        writer.flush().map_err(|e| AgentError::Store(e.to_string()))?;
        Ok(())
    }

    /// `None` when the log has never been created.
    pub fn read_to_string(&self) -> Result<Option<String>, AgentError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AgentError::Store(format!("read {}: {}", self.path.display(), err))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Job {
        title: String,
        company: String,
    }

    fn job(title: &str, company: &str) -> Job {
        Job { title: title.to_string(), company: company.to_string() }
    }

    #[tokio::test]
    async fn load_creates_an_empty_document_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let store = DocStore::new();

        let first: Document<Job> = store.load(&path).await.unwrap();
        assert!(first.records.is_empty());
        assert!(path.exists());

        // Second load returns the same persisted document, not a fresh one.
        let stamp = first.last_updated.clone();
        let second: Document<Job> = store.load(&path).await.unwrap();
        assert!(second.records.is_empty());
        assert_eq!(second.last_updated, stamp);
    }

    #[tokio::test]
    async fn upsert_with_distinct_keys_keeps_one_record_per_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let store = DocStore::new();

        for title in ["A", "B", "C", "B", "A"] {
            store.upsert(&path, job(title, "X"), &["title"]).await.unwrap();
        }
        let doc: Document<Job> = store.load(&path).await.unwrap();
        assert_eq!(doc.records.len(), 3);
    }

    #[tokio::test]
    async fn upsert_replaces_on_matching_key_without_duplicating() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let store = DocStore::new();

        let first = store.upsert(&path, job("A", "X"), &["title"]).await.unwrap();
        assert_eq!(first, UpsertOutcome::Appended);
        let second = store.upsert(&path, job("A", "Y"), &["title"]).await.unwrap();
        assert_eq!(second, UpsertOutcome::Replaced);

        let doc: Document<Job> = store.load(&path).await.unwrap();
        assert_eq!(doc.records.len(), 1);
        assert_eq!(doc.records[0].company, "Y");
    }

    #[tokio::test]
    async fn append_keeps_duplicates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.json");
        let store = DocStore::new();

        store.append(&path, job("A", "X")).await.unwrap();
        store.append(&path, job("A", "X")).await.unwrap();
        let doc: Document<Job> = store.load(&path).await.unwrap();
        assert_eq!(doc.records.len(), 2);
    }

    #[tokio::test]
    async fn query_filters_in_memory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let store = DocStore::new();

        store.append(&path, job("A", "X")).await.unwrap();
        store.append(&path, job("B", "Y")).await.unwrap();
        store.append(&path, job("C", "X")).await.unwrap();
        let hits: Vec<Job> = store.query(&path, |j: &Job| j.company == "X").await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_content_is_distinguishable_from_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = DocStore::new();
        let err = store.load::<Job>(&path).await.unwrap_err();
        assert!(matches!(err, AgentError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn unknown_record_fields_are_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(
            &path,
            br#"{"records":[{"title":"A","company":"X","added_by_v2":true}],"last_updated":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let store = DocStore::new();
        let doc: Document<Job> = store.load(&path).await.unwrap();
        assert_eq!(doc.records, vec![job("A", "X")]);
    }

    // Two writers that both load before either saves: the second full
    // snapshot wins and the first writer's record is lost. This is the
    // documented behavior of uncoordinated cross-process writers, not a
    // defect the store guards against.
    #[tokio::test]
    async fn interleaved_whole_snapshot_writers_lose_the_first_update() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let writer_a = DocStore::new();
        let writer_b = DocStore::new();

        let mut doc_a: Document<Job> = writer_a.load(&path).await.unwrap();
        let mut doc_b: Document<Job> = writer_b.load(&path).await.unwrap();

        doc_a.records.push(job("A", "X"));
        writer_a.save(&path, doc_a).await.unwrap();
        doc_b.records.push(job("B", "Y"));
        writer_b.save(&path, doc_b).await.unwrap();

        let final_doc: Document<Job> = writer_a.load(&path).await.unwrap();
        assert_eq!(final_doc.records, vec![job("B", "Y")]);
    }

    #[test]
    fn csv_header_is_written_exactly_once() {
        let dir = TempDir::new().unwrap();
        let log = CsvLog::new(dir.path().join("jobs.csv"), &["Title", "Company"]);

        log.append(&["A".to_string(), "X".to_string()]).unwrap();
        log.append(&["B".to_string(), "Y, Inc".to_string()]).unwrap();

        let text = log.read_to_string().unwrap().unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Title,Company");
        // Embedded comma gets quoted, nothing else does.
        assert_eq!(lines[2], "B,\"Y, Inc\"");
    }

    #[test]
    fn csv_read_before_creation_is_none() {
        let dir = TempDir::new().unwrap();
        let log = CsvLog::new(dir.path().join("missing.csv"), &["A"]);
        assert!(log.read_to_string().unwrap().is_none());
    }
}

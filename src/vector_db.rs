use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::similarity;
use crate::utils::ensure_dir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Builds a document with a fresh v4 UUID and the current timestamp.
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self::with_id(id, url, title, description, content, embedding)
    }

    pub fn with_id(
        id: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Document {
            id: id.into(),
            url: url.into(),
            title: title.into(),
            description: description.into(),
            content: content.into(),
            embedding,
            created_at: Utc::now(),
        }
    }
}

/// Documents keyed by id, mirrored to a single JSON file.
///
/// Every mutation rewrites the whole file while the write lock is held, so a
/// successful [`DocumentStore::upsert`] is durable by the time it returns.
/// Reads share the lock and never touch the disk.
pub struct DocumentStore {
    documents: RwLock<FxHashMap<String, Document>>,
    path: PathBuf,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DocumentStore {
            documents: RwLock::new(FxHashMap::default()),
            path: path.into(),
        }
    }

    /// Creates a store and hydrates it from `path`. A corrupt file is logged
    /// and the store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(path);
        match store.load() {
            Ok(()) => Ok(store),
            Err(err @ Error::CorruptState { .. }) => {
                warn!(error = %err, "ignoring unreadable document store, starting empty");
                Ok(store)
            }
            Err(err) => Err(err),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or replaces `doc` by id, then rewrites the snapshot on disk.
    ///
    /// On a persistence failure the in-memory map keeps the new document;
    /// calling `upsert` again retries the flush.
    pub fn upsert(&self, doc: Document) -> Result<()> {
        let mut documents = self.write();

        if doc.embedding.is_empty() {
            return Err(Error::Validation(format!(
                "document {} has an empty embedding",
                doc.id
            )));
        }
        if let Some(dim) = documents
            .values()
            .find(|existing| existing.id != doc.id)
            .map(|existing| existing.embedding.len())
        {
            if dim != doc.embedding.len() {
                return Err(Error::Validation(format!(
                    "document {} has embedding dimension {}, store uses {}",
                    doc.id,
                    doc.embedding.len(),
                    dim
                )));
            }
        }

        debug!(id = %doc.id, url = %doc.url, "upserting document");
        documents.insert(doc.id.clone(), doc);
        self.persist(&documents)
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.read().get(id).cloned()
    }

    /// Snapshot of every stored document, in no particular order.
    pub fn list_all(&self) -> Vec<Document> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Replaces the in-memory map with the contents of the backing file.
    ///
    /// A missing file leaves the store as it is.
    pub fn load(&self) -> Result<()> {
        let mut documents = self.write();

        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no existing documents file found, starting fresh");
                return Ok(());
            }
            Err(source) => {
                return Err(Error::Persistence {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let loaded: Vec<Document> =
            serde_json::from_slice(&data).map_err(|source| Error::CorruptState {
                path: self.path.clone(),
                source,
            })?;

        *documents = loaded
            .into_iter()
            .map(|doc| (doc.id.clone(), doc))
            .collect();

        info!(count = documents.len(), path = %self.path.display(), "loaded documents from disk");
        Ok(())
    }

    /// The `k` documents most similar to `query_embedding`, best first.
    pub fn search_by_similarity(&self, query_embedding: &[f32], k: usize) -> Vec<Document> {
        self.search_with_scores(query_embedding, k)
            .into_iter()
            .map(|(_, doc)| doc)
            .collect()
    }

    pub fn search_with_scores(&self, query_embedding: &[f32], k: usize) -> Vec<(f32, Document)> {
        let documents = self.read();
        similarity::top_k(query_embedding, documents.values(), k)
            .into_iter()
            .map(|hit| (hit.score, hit.document.clone()))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<String, Document>> {
        self.documents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<String, Document>> {
        self.documents.write().unwrap_or_else(PoisonError::into_inner)
    }

    // Callers hold the write guard, so no other writer can interleave.
    fn persist(&self, documents: &FxHashMap<String, Document>) -> Result<()> {
        let persistence = |source: io::Error| Error::Persistence {
            path: self.path.clone(),
            source,
        };

        let dir = self
            .path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        ensure_dir(dir).map_err(persistence)?;

        let snapshot: Vec<&Document> = documents.values().collect();
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| persistence(io::Error::other(err)))?;

        let tmp = temp_path(&self.path);
        let mut file = File::create(&tmp).map_err(persistence)?;
        file.write_all(&data).map_err(persistence)?;
        file.sync_all().map_err(persistence)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(persistence)?;
        sync_dir(dir).map_err(persistence)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

// Makes the rename itself durable.
fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

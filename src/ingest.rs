//! Batch ingestion: page records in, embedded documents out.
//!
//! A fixed pool of workers drains one shared queue. A record that fails to
//! embed or persist is logged and skipped; its siblings carry on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{DEFAULT_MAX_EMBED_CHARS, DEFAULT_NUM_WORKERS, RagConfig};
use crate::error::{Error, Result};
use crate::llm::Embedder;
use crate::utils::{normalize_text, truncate_chars};
use crate::vector_db::{Document, DocumentStore};

/// Raw extracted page content awaiting embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub main_content: Vec<String>,
    #[serde(default)]
    pub link_count: usize,
}

impl PageRecord {
    /// Title, description and content folded into one normalized string,
    /// cut to `max_chars` characters.
    pub fn embedding_text(&self, max_chars: usize) -> String {
        let combined = format!(
            "{}. {}. {}",
            self.title,
            self.description,
            self.main_content.join(" ")
        );
        let normalized = normalize_text(&combined);
        truncate_chars(&normalized, max_chars).to_string()
    }
}

/// Shared stop signal checked by workers before each provider call.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestReport {
    pub total: usize,
    pub stored: usize,
    pub skipped: usize,
}

type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<(usize, PageRecord)>>>;

pub struct IngestPipeline<E> {
    embedder: Arc<E>,
    store: Arc<DocumentStore>,
    num_workers: usize,
    max_embed_chars: usize,
    cancel: CancelFlag,
}

impl<E> IngestPipeline<E>
where
    E: Embedder + 'static,
{
    pub fn new(embedder: Arc<E>, store: Arc<DocumentStore>) -> Self {
        IngestPipeline {
            embedder,
            store,
            num_workers: DEFAULT_NUM_WORKERS,
            max_embed_chars: DEFAULT_MAX_EMBED_CHARS,
            cancel: CancelFlag::new(),
        }
    }

    pub fn from_config(embedder: Arc<E>, store: Arc<DocumentStore>, config: &RagConfig) -> Self {
        Self::new(embedder, store)
            .with_workers(config.num_workers)
            .with_max_embed_chars(config.max_embed_chars)
    }

    /// Zero is treated as one worker.
    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers.max(1);
        self
    }

    pub fn with_max_embed_chars(mut self, max_chars: usize) -> Self {
        self.max_embed_chars = max_chars.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Embeds and stores every record, returning once all workers have
    /// drained the queue. Never fails as a whole.
    pub async fn run(&self, records: Vec<PageRecord>) -> IngestReport {
        let total = records.len();
        if total == 0 {
            return IngestReport::default();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let queue: JobQueue = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker in 0..self.num_workers.min(total) {
            workers.spawn(run_worker(
                worker,
                total,
                Arc::clone(&queue),
                Arc::clone(&self.embedder),
                Arc::clone(&self.store),
                self.max_embed_chars,
                self.cancel.clone(),
            ));
        }

        for job in records.into_iter().enumerate() {
            if tx.send(job).is_err() {
                break;
            }
        }
        drop(tx);

        let mut stored = 0;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(count) => stored += count,
                Err(err) => warn!(error = %err, "ingestion worker terminated abnormally"),
            }
        }

        let report = IngestReport {
            total,
            stored,
            skipped: total - stored,
        };
        info!(
            total = report.total,
            stored = report.stored,
            skipped = report.skipped,
            "ingestion finished"
        );
        report
    }
}

async fn run_worker<E: Embedder>(
    worker: usize,
    total: usize,
    queue: JobQueue,
    embedder: Arc<E>,
    store: Arc<DocumentStore>,
    max_embed_chars: usize,
    cancel: CancelFlag,
) -> usize {
    let mut stored = 0;
    loop {
        let job = queue.lock().await.recv().await;
        let Some((index, record)) = job else {
            break;
        };

        info!(worker, page = index + 1, total, title = %record.title, "generating embedding");
        match ingest_record(&record, embedder.as_ref(), &store, max_embed_chars, &cancel).await {
            Ok(dim) => {
                stored += 1;
                info!(worker, page = index + 1, dim, "document saved");
            }
            Err(err) => warn!(worker, url = %record.url, error = %err, "skipping page"),
        }
    }
    stored
}

async fn ingest_record<E: Embedder>(
    record: &PageRecord,
    embedder: &E,
    store: &Arc<DocumentStore>,
    max_embed_chars: usize,
    cancel: &CancelFlag,
) -> Result<usize> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let text = record.embedding_text(max_embed_chars);
    let embedding = embedder.embed_one(&text).await?;
    let dim = embedding.len();

    let doc = Document::new(
        record.url.clone(),
        record.title.clone(),
        record.description.clone(),
        record.main_content.join("\n"),
        embedding,
    );

    // Flushing happens under the store's write lock; keep it off the runtime.
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || store.upsert(doc))
        .await
        .map_err(|err| Error::Io(std::io::Error::other(err)))??;

    Ok(dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct FakeEmbedder {
        fail_on: Option<String>,
        seen: StdMutex<Vec<String>>,
    }

    impl FakeEmbedder {
        fn new(fail_on: Option<&str>) -> Self {
            FakeEmbedder {
                fail_on: fail_on.map(str::to_string),
                seen: StdMutex::new(Vec::new()),
            }
        }
    }

    impl Embedder for FakeEmbedder {
        async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
            self.seen.lock().unwrap().push(text.to_string());
            if let Some(bad) = &self.fail_on {
                if text.contains(bad.as_str()) {
                    return Err(Error::Provider("embedding backend unavailable".into()));
                }
            }
            Ok(vec![text.chars().count() as f32, 1.0, 0.5])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::with_capacity(texts.len());
            for text in texts {
                out.push(self.embed_one(text).await?);
            }
            Ok(out)
        }
    }

    fn page(title: &str) -> PageRecord {
        PageRecord {
            url: format!("https://pkg.example/{title}"),
            title: title.to_string(),
            description: format!("About {title}"),
            main_content: vec![format!("{title} first fragment"), "second fragment".into()],
            link_count: 2,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_embedding_skips_only_that_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("documents.json");
        let store = Arc::new(DocumentStore::new(&path));
        let embedder = Arc::new(FakeEmbedder::new(Some("broken")));

        let records = vec![
            page("strings"),
            page("bytes"),
            page("broken"),
            page("sync"),
            page("time"),
        ];
        let report = IngestPipeline::new(embedder, Arc::clone(&store))
            .with_workers(2)
            .run(records)
            .await;

        assert_eq!(
            report,
            IngestReport {
                total: 5,
                stored: 4,
                skipped: 1
            }
        );
        assert_eq!(store.len(), 4);
        assert!(store.list_all().iter().all(|d| d.title != "broken"));

        let reloaded = DocumentStore::new(&path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.len(), 4);
    }

    #[tokio::test]
    async fn stored_document_keeps_page_fields() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(dir.path().join("documents.json")));
        let report = IngestPipeline::new(Arc::new(FakeEmbedder::new(None)), Arc::clone(&store))
            .run(vec![page("fmt")])
            .await;
        assert_eq!(report.stored, 1);

        let doc = store.list_all().pop().unwrap();
        assert_eq!(doc.url, "https://pkg.example/fmt");
        assert_eq!(doc.title, "fmt");
        assert_eq!(doc.description, "About fmt");
        assert_eq!(doc.content, "fmt first fragment\nsecond fragment");
        assert_eq!(doc.embedding.len(), 3);
        assert!(!doc.id.is_empty());
    }

    #[tokio::test]
    async fn embedding_text_is_truncated() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(dir.path().join("documents.json")));
        let embedder = Arc::new(FakeEmbedder::new(None));

        let mut long = page("long");
        long.main_content = vec!["ü".repeat(5000)];
        IngestPipeline::new(Arc::clone(&embedder), store)
            .with_max_embed_chars(2000)
            .run(vec![long])
            .await;

        let seen = embedder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].chars().count(), 2000);
        assert!(seen[0].starts_with("long. About long. "));
    }

    #[tokio::test]
    async fn cancelled_pipeline_makes_no_provider_calls() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(dir.path().join("documents.json")));
        let embedder = Arc::new(FakeEmbedder::new(None));

        let pipeline = IngestPipeline::new(Arc::clone(&embedder), Arc::clone(&store));
        pipeline.cancel_flag().cancel();
        let report = pipeline.run(vec![page("a"), page("b"), page("c")]).await;

        assert_eq!(report.stored, 0);
        assert_eq!(report.skipped, 3);
        assert!(embedder.seen.lock().unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn new_pipeline_uses_shared_defaults() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(dir.path().join("documents.json")));
        let pipeline = IngestPipeline::new(Arc::new(FakeEmbedder::new(None)), store);
        let config = RagConfig::default();
        assert_eq!(pipeline.num_workers, config.num_workers);
        assert_eq!(pipeline.max_embed_chars, config.max_embed_chars);
        assert_eq!(pipeline.num_workers, DEFAULT_NUM_WORKERS);
    }

    #[tokio::test]
    async fn empty_input_and_zero_workers() {
        let dir = tempdir().unwrap();
        let store = Arc::new(DocumentStore::new(dir.path().join("documents.json")));
        let pipeline = IngestPipeline::new(Arc::new(FakeEmbedder::new(None)), Arc::clone(&store))
            .with_workers(0);

        assert_eq!(pipeline.run(Vec::new()).await, IngestReport::default());
        assert_eq!(pipeline.run(vec![page("one"), page("two")]).await.stored, 2);
    }

    #[test]
    fn page_record_embedding_text_normalizes() {
        let record = PageRecord {
            url: "u".into(),
            title: "Title".into(),
            description: "Desc\n\nhere".into(),
            main_content: vec!["a".into(), " b ".into()],
            link_count: 0,
        };
        assert_eq!(record.embedding_text(2000), "Title. Desc here. a b");
        assert_eq!(record.embedding_text(5), "Title");
    }
}

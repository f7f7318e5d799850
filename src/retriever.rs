use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::llm::{Embedder, Generator};
use crate::vector_db::{Document, DocumentStore};

const DOCUMENT_SEPARATOR: &str = "\n---\n\n";

/// An answer and the documents it was grounded on, best match first.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub answer: String,
    pub sources: Vec<Document>,
}

/// Answers questions from the store's nearest documents. Without any
/// retrieved context the query fails instead of answering unaugmented.
pub struct Retriever<E, G> {
    embedder: Arc<E>,
    generator: Arc<G>,
    store: Arc<DocumentStore>,
    top_k: usize,
}

impl<E, G> Retriever<E, G>
where
    E: Embedder,
    G: Generator,
{
    pub fn new(embedder: Arc<E>, generator: Arc<G>, store: Arc<DocumentStore>, top_k: usize) -> Self {
        Retriever {
            embedder,
            generator,
            store,
            top_k: top_k.max(1),
        }
    }

    /// Streams the answer into `answer_sink` chunk by chunk and returns it.
    pub async fn query<S>(&self, question: &str, answer_sink: S) -> Result<String>
    where
        S: FnMut(&str) + Send,
    {
        self.query_with_sources(question, answer_sink)
            .await
            .map(|outcome| outcome.answer)
    }

    pub async fn query_with_sources<S>(&self, question: &str, mut answer_sink: S) -> Result<QueryOutcome>
    where
        S: FnMut(&str) + Send,
    {
        let sources = self.retrieved_documents(question).await?;
        if sources.is_empty() {
            return Err(Error::NoContext);
        }

        debug!(stage = "composing", documents = sources.len());
        let prompt = build_prompt(&render_context(&sources), question.trim());

        debug!(stage = "generating", prompt_chars = prompt.len());
        let mut streamed = String::new();
        let complete = self
            .generator
            .generate(&prompt, |chunk: &str| {
                answer_sink(chunk);
                streamed.push_str(chunk);
            })
            .await?;

        let answer = if complete.is_empty() { streamed } else { complete };
        info!(sources = sources.len(), answer_chars = answer.len(), "query answered");
        Ok(QueryOutcome { answer, sources })
    }

    /// The documents a query would be grounded on, without generating.
    pub async fn retrieved_documents(&self, question: &str) -> Result<Vec<Document>> {
        let question = question.trim();
        if question.is_empty() {
            return Err(Error::Validation("query cannot be empty".into()));
        }

        debug!(stage = "embedding");
        let embedding = self.embedder.embed_one(question).await?;

        debug!(stage = "retrieving", top_k = self.top_k);
        let hits = self.store.search_with_scores(&embedding, self.top_k);
        for (rank, (score, doc)) in hits.iter().enumerate() {
            debug!(rank = rank + 1, score, id = %doc.id, title = %doc.title, "retrieved");
        }
        Ok(hits.into_iter().map(|(_, doc)| doc).collect())
    }
}

/// Numbered document blocks in ranking order.
pub fn render_context(documents: &[Document]) -> String {
    documents
        .iter()
        .enumerate()
        .map(|(i, doc)| {
            format!(
                "[Document {}]\nTitle: {}\nURL: {}\nContent: {}\n",
                i + 1,
                doc.title,
                doc.url,
                doc.content
            )
        })
        .collect::<Vec<_>>()
        .join(DOCUMENT_SEPARATOR)
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Answer the question using only the following context. \
         If the context does not contain the answer, say so.\n\n\
         Context:\n{context}\n\n---\n\nQuestion: {question}\n\nAnswer:"
    )
}

//! Embedding-indexed document store with retrieval-augmented answering.
//!
//! [`IngestPipeline`] embeds crawled pages into a [`DocumentStore`];
//! [`Retriever`] answers questions from the store's nearest documents.

pub mod config;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod retriever;
pub mod similarity;
pub mod utils;
pub mod vector_db;

pub use config::RagConfig;
pub use error::{Error, Result};
pub use ingest::{CancelFlag, IngestPipeline, IngestReport, PageRecord};
pub use llm::{Embedder, Generator, OllamaClient};
pub use retriever::{QueryOutcome, Retriever};
pub use similarity::{cosine_similarity, top_k};
pub use vector_db::{Document, DocumentStore};

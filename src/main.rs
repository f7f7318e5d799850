use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use docrag::utils::{load_page_records_from_dir, load_page_records_jsonl};
use docrag::{DocumentStore, Error, IngestPipeline, OllamaClient, RagConfig, Retriever};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Embed page records into the document store
    Ingest,
    /// Answer questions interactively from the document store
    Query,
}

#[derive(Parser, Debug)]
#[command(
    name = "docrag",
    about = "Index documents by embedding and answer questions over them"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = Mode::Query)]
    mode: Mode,

    /// Page records to ingest: a JSONL file or a directory of .txt/.md files
    #[arg(long)]
    pages: Option<PathBuf>,

    /// Document store file
    #[arg(long)]
    store: Option<PathBuf>,

    /// Documents retrieved per question
    #[arg(long)]
    top_k: Option<usize>,

    /// Parallel embedding workers during ingestion
    #[arg(long)]
    workers: Option<usize>,

    /// Generation model
    #[arg(long)]
    model: Option<String>,

    /// Embedding model
    #[arg(long)]
    embed_model: Option<String>,

    /// Base URL of the Ollama server
    #[arg(long)]
    ollama_url: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn apply(&self, config: &mut RagConfig) {
        if let Some(store) = &self.store {
            config.store_path = store.clone();
        }
        if let Some(top_k) = self.top_k {
            config.top_k = top_k;
        }
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(model) = &self.embed_model {
            config.embed_model = model.clone();
        }
        if let Some(url) = &self.ollama_url {
            config.ollama_url = url.clone();
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCRAG_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config = RagConfig::from_env()?;
    cli.apply(&mut config);
    config.validate()?;

    let store = Arc::new(
        DocumentStore::open(&config.store_path)
            .with_context(|| format!("failed to open {}", config.store_path.display()))?,
    );
    let client = Arc::new(OllamaClient::new(&config)?);

    match cli.mode {
        Mode::Ingest => {
            let pages = cli
                .pages
                .as_deref()
                .context("--pages is required in ingest mode")?;
            ingest(pages, client, store, &config).await
        }
        Mode::Query => query_loop(client, store, &config).await,
    }
}

async fn ingest(
    pages: &Path,
    client: Arc<OllamaClient>,
    store: Arc<DocumentStore>,
    config: &RagConfig,
) -> Result<()> {
    let records = if pages.is_dir() {
        load_page_records_from_dir(pages)
    } else {
        load_page_records_jsonl(pages)
    }
    .with_context(|| format!("failed to read page records from {}", pages.display()))?;
    info!(count = records.len(), "loaded page records");

    let pipeline = IngestPipeline::from_config(client, Arc::clone(&store), config);
    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight pages");
            cancel.cancel();
        }
    });

    let report = pipeline.run(records).await;
    println!(
        "Stored {} of {} pages ({} skipped); store now holds {} documents at {}",
        report.stored,
        report.total,
        report.skipped,
        store.len(),
        store.path().display()
    );
    Ok(())
}

async fn query_loop(
    client: Arc<OllamaClient>,
    store: Arc<DocumentStore>,
    config: &RagConfig,
) -> Result<()> {
    if store.is_empty() {
        warn!("document store is empty; run with --mode ingest first");
    }
    let retriever = Retriever::new(Arc::clone(&client), client, store, config.top_k);

    println!("Ask a question about the indexed documents (type 'exit' to quit).");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.eq_ignore_ascii_case("exit") {
            println!("Goodbye!");
            break;
        }
        if question.is_empty() {
            continue;
        }

        let start = Instant::now();
        let outcome = retriever
            .query_with_sources(question, |chunk: &str| {
                print!("{chunk}");
                let _ = std::io::stdout().flush();
            })
            .await;

        match outcome {
            Ok(outcome) => {
                println!("\n\nSources:");
                for (i, doc) in outcome.sources.iter().enumerate() {
                    println!("  [{}] {} <{}>", i + 1, doc.title, doc.url);
                }
                println!("\nExecution time: {:.2?}\n", start.elapsed());
            }
            Err(Error::NoContext) => {
                println!("No relevant documents found. Ingest some pages first.");
            }
            Err(err) => warn!(error = %err, "query failed"),
        }
    }

    Ok(())
}

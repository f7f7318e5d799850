use std::fs::{self, DirBuilder};
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::error::{Error, Result};
use crate::ingest::PageRecord;

/// Page files are packed into fragments of at most this many characters.
const FRAGMENT_CHARS: usize = 500;

/// Creates a directory if it doesn't exist
pub fn ensure_dir(path: impl AsRef<Path>) -> io::Result<()> {
    DirBuilder::new().recursive(true).create(path)
}

/// NFC-normalizes `text` and collapses every whitespace run to one space.
pub fn normalize_text(text: &str) -> String {
    lazy_static! {
        static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    }

    let text = text.nfc().collect::<String>();
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

/// Keeps at most `max_chars` characters, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Groups whitespace-separated words into sentences. A sentence ends at a
/// word whose last character is `.`, `!` or `?`, so decimals, versions and
/// URLs stay intact.
fn sentences(text: &str) -> Vec<Vec<&str>> {
    let mut out = Vec::new();
    let mut current = Vec::new();
    for word in text.split_whitespace() {
        current.push(word);
        if word.ends_with(['.', '!', '?']) {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Packs whole sentences into chunks of at most `max_chars` characters.
///
/// A sentence too long for one chunk is packed word by word; a single word
/// longer than `max_chars` becomes a chunk of its own. The text itself is
/// never rewritten: joining the chunks with spaces gives back the input with
/// only its whitespace collapsed.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current_chunk = String::new();
    let mut current_length = 0;

    for sentence in sentences(text) {
        let joined = sentence.join(" ");
        let units = if joined.chars().count() <= max_chars {
            vec![joined]
        } else {
            sentence.iter().map(|word| word.to_string()).collect()
        };

        for unit in units {
            let unit_len = unit.chars().count();
            if current_length > 0 && current_length + 1 + unit_len > max_chars {
                chunks.push(std::mem::take(&mut current_chunk));
                current_length = 0;
            }
            if current_length > 0 {
                current_chunk.push(' ');
                current_length += 1;
            }
            current_chunk.push_str(&unit);
            current_length += unit_len;
        }
    }

    if !current_chunk.is_empty() {
        chunks.push(current_chunk);
    }

    chunks
}

/// Reads page records from a JSON-lines file, one record per non-blank line.
pub fn load_page_records_jsonl(path: impl AsRef<Path>) -> Result<Vec<PageRecord>> {
    let path = path.as_ref();
    let reader = BufReader::new(fs::File::open(path)?);
    let mut records = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: PageRecord = serde_json::from_str(&line).map_err(|err| {
            Error::Validation(format!("{}:{}: {err}", path.display(), line_no + 1))
        })?;
        records.push(record);
    }

    Ok(records)
}

/// Turns every `.txt` and `.md` file under `dir_path` into a page record.
///
/// The title is the first markdown heading, or the file stem when there is
/// none. Files are visited in path order so runs are reproducible.
pub fn load_page_records_from_dir(dir_path: impl AsRef<Path>) -> Result<Vec<PageRecord>> {
    let mut records = Vec::new();
    let dir_path = dir_path.as_ref();

    if !dir_path.exists() {
        return Ok(records);
    }

    let mut entries: Vec<_> = fs::read_dir(dir_path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            records.extend(load_page_records_from_dir(&path)?);
            continue;
        }
        let is_text = path
            .extension()
            .is_some_and(|ext| ext == "txt" || ext == "md");
        if !is_text {
            continue;
        }

        let content = fs::read_to_string(&path)?;
        let fragments = split_into_chunks(&content, FRAGMENT_CHARS);
        let title = extract_title(&content, &path);
        let link_count = content.matches("http://").count() + content.matches("https://").count();

        records.push(PageRecord {
            url: format!("file://{}", path.display()),
            title,
            description: String::new(),
            main_content: fragments,
            link_count,
        });
    }

    Ok(records)
}

fn extract_title(content: &str, path: &Path) -> String {
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("# "))
        .map(str::trim)
        .find(|heading| !heading.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("untitled")
                .to_string()
        })
}

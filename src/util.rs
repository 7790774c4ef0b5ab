use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};

/// Wall-clock source. Production code uses [`SystemClock`]; tests pin time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Write `content` to `path` via a sibling temp file + rename, so readers
/// never observe a half-written cache file.
pub fn atomic_write_str(path: &Path, content: &str) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Collapse runs of whitespace to single spaces and trim.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max_chars` characters (not bytes).
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Case-insensitive "contains any of" over already-lowercased haystacks.
pub fn contains_any<S: AsRef<str>>(haystack_lower: &str, needles: &[S]) -> bool {
    needles.iter().any(|needle| {
        let needle = needle.as_ref();
        !needle.is_empty() && haystack_lower.contains(&needle.to_lowercase())
    })
}

//! Utility functions for string handling, model responses and file system checks.
//!
//! This module provides helper functions used throughout the application:
//! - String truncation for logging and bounded prompt excerpts
//! - Whitespace normalization for scraped page text
//! - Code-fence stripping and JSON error classification for model responses
//! - File system validation for the cache location

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fs as stdfs;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument};

static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json|JSON)?").expect("valid code fence regex"));

/// Take at most `max` characters of `s`, respecting char boundaries.
pub fn excerpt(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncate a string for logging purposes.
///
/// Long strings are truncated to `max` characters with an ellipsis and
/// byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    let head = excerpt(s, max);
    if head.len() == s.len() {
        s.to_string()
    } else {
        format!("{}…(+{} bytes)", head, s.len() - head.len())
    }
}

/// Collapse runs of whitespace into single spaces.
pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove Markdown code fences the model likes to wrap JSON in.
pub fn strip_code_fences(raw: &str) -> String {
    CODE_FENCE_RE.replace_all(raw, "").trim().to_string()
}

/// Detect if a serde_json error indicates truncated/incomplete JSON.
///
/// When the model response is cut off (e.g., due to token limits), the
/// resulting JSON will fail to parse with an EOF error.
pub fn looks_truncated(e: &serde_json::Error) -> bool {
    use serde_json::error::Category;
    matches!(e.classify(), Category::Eof)
}

/// Ensure a directory exists and is writable.
///
/// This function creates the directory if it doesn't exist, then performs
/// a write test by creating and immediately deleting a probe file.
///
/// # Errors
///
/// Returns an error if:
/// - The directory cannot be created
/// - The directory is not writable (permission denied, read-only filesystem, etc.)
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_dir(path: &Path) -> Result<(), Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(path).await?;
    // Try a small sync write using std fs (simpler error surface)
    let probe_path = path.join("..__probe_write__");
    match stdfs::File::create(&probe_path) {
        Ok(_) => {
            let _ = stdfs::remove_file(&probe_path);
            info!("Cache directory is writable");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}

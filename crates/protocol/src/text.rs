//! Text utilities shared across the scanner: token estimation, binary
//! detection, tolerant file reads, and model-output cleanup.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Conservative chars-per-token heuristic used for all budget math.
const CHARS_PER_TOKEN: usize = 4;

/// Extensions that are always binary; checked before the content probe.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "mp3", "mp4", "avi", "mov", "wav",
    "flac", "ogg", "webm", "zip", "tar", "gz", "bz2", "xz", "7z", "rar", "exe", "dll", "so",
    "dylib", "o", "obj", "a", "lib", "pyc", "class", "jar", "pdf", "doc", "docx", "xls", "xlsx",
    "ppt", "pptx", "db", "sqlite", "sqlite3", "ttf", "otf", "woff", "woff2", "eot", "bin", "dat",
    "iso", "img",
];

static FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^```(?:json)?\s*\n?(.*?)\n?```\s*$").expect("fence regex")
});

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// Binary check: known extension first, then a NUL byte within the
/// first 8 KiB. Unreadable files count as non-binary so the caller
/// surfaces the read error instead.
pub fn is_binary_file(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return true;
        }
    }

    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    let mut buf = [0u8; 8192];
    match file.read(&mut buf) {
        Ok(n) => buf[..n].contains(&0),
        Err(_) => false,
    }
}

/// Read a text file, returning `None` for binary or unreadable files.
/// Invalid UTF-8 is replaced rather than treated as an error.
pub fn read_file_content(path: &Path) -> Option<String> {
    if is_binary_file(path) {
        return None;
    }
    match std::fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) => {
            log::warn!("Could not read file {}: {err}", path.display());
            None
        }
    }
}

/// Strip a ```-fenced wrapper around a JSON object. Models wrap JSON in
/// fences despite instructions not to. Idempotent: stripping twice
/// equals stripping once.
pub fn strip_code_fences(content: &str) -> String {
    let content = content.trim();
    match FENCE_RE.captures(content) {
        Some(caps) => caps[1].trim().to_string(),
        None => content.to_string(),
    }
}

/// Collapse whitespace runs to single spaces and trim. Used for issue
/// identity so formatting-only edits do not break matching.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase hex SHA-256, the content identity used everywhere change
/// detection compares file versions.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

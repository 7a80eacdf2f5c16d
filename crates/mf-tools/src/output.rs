//! Helpers for reading what a tool left behind.

use std::path::{Path, PathBuf};

/// Parse the last non-empty line of `text` as a JSON object.
///
/// Tools that report structured results print them as the final line, after
/// whatever progress chatter they produce.
pub fn parse_last_json_line(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let line = text.lines().map(str::trim).rev().find(|l| !l.is_empty())?;
    match serde_json::from_str(line) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Regular files directly inside `dir`, sorted by name.
pub fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Pick the produced file: the first whose extension is in `preferred`
/// (case-insensitive), else the first file at all.
pub fn pick_output(dir: &Path, preferred: &[&str]) -> std::io::Result<Option<PathBuf>> {
    let files = list_files(dir)?;
    let preferred_match = files.iter().find(|f| {
        f.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| preferred.iter().any(|p| p.eq_ignore_ascii_case(e)))
    });
    Ok(preferred_match.or(files.first()).cloned())
}

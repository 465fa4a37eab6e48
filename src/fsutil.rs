//! File helpers for module code, dry-run aware

use anyhow::{Context, Result};
use similar::TextDiff;
use std::fs;
use std::path::Path;

/// Make `path` contain exactly `contents`.
///
/// Logs a unified diff when the file changes. In a dry run nothing is
/// written, but the return value still says whether a write was needed.
pub fn set_file_contents(path: &Path, contents: &str, dry_run: bool) -> Result<bool> {
    let existing = match fs::read_to_string(path) {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(e).with_context(|| format!("Could not read {}", path.display()));
        }
    };
    if existing.as_deref() == Some(contents) {
        return Ok(false);
    }

    let name = path.display().to_string();
    log::info!(
        "{} {name}:\n{}",
        if existing.is_some() { "Changing" } else { "Creating" },
        unified_diff(existing.as_deref().unwrap_or(""), contents, &name)
    );
    if dry_run {
        log::info!("Dry run: not writing {name}");
        return Ok(true);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Could not create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("Could not write {name}"))?;
    Ok(true)
}

/// Like [`set_file_contents`], for JSON documents (two-space indent)
pub fn set_json_contents(path: &Path, value: &serde_json::Value, dry_run: bool) -> Result<bool> {
    let text = serde_json::to_string_pretty(value)?;
    set_file_contents(path, &text, dry_run)
}

/// Create `path` and its parents
pub fn make_directory(path: &Path, dry_run: bool) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    if dry_run {
        log::info!("Dry run: not creating {}", path.display());
        return Ok(true);
    }
    fs::create_dir_all(path).with_context(|| format!("Could not create {}", path.display()))?;
    Ok(true)
}

/// Unified diff between two texts
pub fn unified_diff(old: &str, new: &str, name: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{name}"), &format!("b/{name}"))
        .to_string()
}

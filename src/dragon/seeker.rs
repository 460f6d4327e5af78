//! Seeker: importing existing projects (spec §4.3).
//!
//! Walks a directory, heuristically classifies what it finds by file
//! extension, and drafts an initial specification a user can hand to
//! Sage for refinement.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const MAX_SCAN_ENTRIES: usize = 5_000;
const MAX_SCAN_DEPTH: usize = 8;

const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules", ".forge", "dist", "build", "vendor"];

/// A directory scan's classification counts, keyed by a human-readable
/// bucket name ("rust", "javascript", "config", "docs", "other").
#[derive(Debug, Default)]
pub struct ScanSummary {
    pub buckets: BTreeMap<&'static str, usize>,
    pub total_files: usize,
    pub truncated: bool,
}

fn classify_extension(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "rs" => "rust",
        "js" | "jsx" | "ts" | "tsx" | "mjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" | "kt" => "jvm",
        "toml" | "yaml" | "yml" | "json" => "config",
        "md" | "txt" | "rst" => "docs",
        _ => "other",
    }
}

/// Recursively scan `root`, bounded by [`MAX_SCAN_ENTRIES`] and
/// [`MAX_SCAN_DEPTH`] so a user-pointed-at-`/` mistake can't hang the
/// council turn.
pub fn scan_directory(root: &Path) -> std::io::Result<ScanSummary> {
    let mut summary = ScanSummary::default();
    walk(root, 0, &mut summary)?;
    Ok(summary)
}

fn walk(dir: &Path, depth: usize, summary: &mut ScanSummary) -> std::io::Result<()> {
    if depth > MAX_SCAN_DEPTH || summary.total_files >= MAX_SCAN_ENTRIES {
        summary.truncated = true;
        return Ok(());
    }

    for entry in std::fs::read_dir(dir)? {
        if summary.total_files >= MAX_SCAN_ENTRIES {
            summary.truncated = true;
            break;
        }
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if IGNORED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            walk(&path, depth + 1, summary)?;
        } else if file_type.is_file() {
            summary.total_files += 1;
            let bucket = path
                .extension()
                .and_then(|e| e.to_str())
                .map(classify_extension)
                .unwrap_or("other");
            *summary.buckets.entry(bucket).or_insert(0) += 1;
        }
    }
    Ok(())
}

/// Draft a starting specification from a scan, for Sage to refine.
pub fn draft_specification(root: &Path, summary: &ScanSummary) -> String {
    let mut out = format!("# Imported project: {}\n\n", root.display());
    out.push_str(&format!("Scanned {} files.\n\n", summary.total_files));
    out.push_str("## Detected composition\n\n");
    for (bucket, count) in &summary.buckets {
        out.push_str(&format!("- {bucket}: {count} files\n"));
    }
    if summary.truncated {
        out.push_str("\n_Scan truncated; this is a partial view._\n");
    }
    out
}

/// Pull a filesystem path out of an `/import`/`/scan` turn, explicit or
/// free-text — the first token that looks like a path.
pub fn extract_path_arg(text: &str) -> Option<PathBuf> {
    let trimmed = text.trim();
    let rest = if trimmed.starts_with('/') {
        trimmed.split_whitespace().skip(1).collect::<Vec<_>>().join(" ")
    } else {
        trimmed.to_string()
    };
    rest.split_whitespace()
        .find(|tok| tok.starts_with('/') || tok.starts_with('~') || tok.starts_with("./"))
        .map(PathBuf::from)
}

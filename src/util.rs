//! Shared utility functions for the Forge crate.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

/// Serialize `value` to pretty JSON and write it to `path` atomically:
/// write to a sibling temp file, then rename over the destination. A
/// reader never observes a partially-written file, which matters for
/// state the registry and tracker persist on every mutation.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path {} has no parent directory", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let content = serde_json::to_string_pretty(value).context("failed to serialize to JSON")?;

    let tmp_path = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("forge"),
        std::process::id()
    ));
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write temp file {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Sanitize a free-text name into a filesystem-safe directory component:
/// alphanumerics and `-` pass through, everything else becomes `-`.
pub fn sanitize_path_component(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Where a project's per-project artifacts live under `projects_root`
/// (spec §6.3): `wyrm-recommendation.json`, `analysis.json`, `tasks/`,
/// and `kobold-plans/` all hang off this same directory.
pub fn project_dir(projects_root: &Path, project_name: &str) -> std::path::PathBuf {
    projects_root.join(sanitize_path_component(project_name))
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

//! Path helpers and text cleanup shared across stages

use std::path::{Path, PathBuf};

/// Name of the per-project config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "quest-flow.yaml";

/// Suffix of assembled workflow documents; never offered as flow input.
pub const WORKFLOW_SUFFIX: &str = ".workflow.json";

/// Get the path to the user config file
pub fn user_config_path() -> Option<PathBuf> {
    use directories::ProjectDirs;

    ProjectDirs::from("com", "quest-flow", "quest-flow")
        .map(|proj_dirs| proj_dirs.config_dir().join("config.yaml"))
}

pub fn local_config_path() -> PathBuf {
    PathBuf::from(LOCAL_CONFIG_FILE)
}

/// Extract JSON content from markdown code blocks or raw text
///
/// Handles ```json blocks, generic ``` blocks and raw JSON.
pub fn extract_json(text: &str) -> String {
    let trimmed = text.trim();
    let body = match trimmed.find("```") {
        Some(fence) => {
            let after = &trimmed[fence + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            match after.rfind("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => trimmed,
    };
    body.trim().to_string()
}

/// Overlay `overlay` onto `base`: objects merge key by key, nulls are
/// ignored, everything else replaces.
pub fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    use serde_json::Value;

    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (slot, value) => *slot = value,
    }
}

/// Lowercase, hyphen-separated identifier: `"Genre Choice!"` -> `"genre-choice"`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;

    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}

/// Default output path for an assembled workflow: `flows/quiz.json` ->
/// `flows/quiz.workflow.json`.
pub fn workflow_path_for(flow_path: &Path) -> PathBuf {
    let stem = flow_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "flow".to_string());
    flow_path.with_file_name(format!("{}{}", stem, WORKFLOW_SUFFIX))
}

/// Files in `dir` with one of `extensions`, sorted by name. Assembled
/// workflow documents are left out.
pub fn list_candidate_files(dir: &Path, extensions: &[&str]) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.ends_with(WORKFLOW_SUFFIX) {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| extensions.iter().any(|wanted| ext.eq_ignore_ascii_case(wanted)))
            .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

//! Matching report file identifiers against source paths
//!
//! Coverage tools disagree on how they name files: some emit paths relative
//! to the project root, some absolute, some only a module-relative suffix.
//! Matching is purely lexical and never touches the filesystem.

/// Normalize separators to `/` and resolve `.` and `..` segments lexically
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let absolute = unified.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

fn file_name(normalized: &str) -> &str {
    normalized.rsplit('/').next().unwrap_or(normalized)
}

/// Does a report's file identifier refer to `source_path`?
///
/// Tried in order: exact match after normalization, `source_path` ending
/// with the report path, then equal file names. The suffix test is a plain
/// string suffix, so `a.py` also matches `ba.py`. The last two rules are
/// heuristics and can confuse files with similar names.
pub fn matches(report_path: &str, source_path: &str) -> bool {
    let report = normalize_path(report_path);
    let source = normalize_path(source_path);

    if report == source {
        return true;
    }

    if source.ends_with(report.as_str()) {
        return true;
    }

    let report_name = file_name(&report);
    !report_name.is_empty() && report_name != "." && report_name == file_name(&source)
}

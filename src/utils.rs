//! Shared utility helpers.

use std::path::{Path, PathBuf};

/// Truncate a string to `max` bytes (on a char boundary), appending `…` if trimmed.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// `dir/shot.png` + `console.log` → `dir/shot.console.log`.
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string());
    path.with_file_name(format!("{stem}.{suffix}"))
}

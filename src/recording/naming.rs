use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Lowercase, whitespace to `_`, keep only `[a-z0-9_-]`, truncate
pub fn sanitize_name(hint: &str, max_len: usize) -> String {
    hint.trim()
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .take(max_len)
        .collect()
}

pub fn fallback_name(now: DateTime<Utc>) -> String {
    format!("recording_{}", now.format("%Y%m%d_%H%M%S"))
}

/// Name for a finished recording: the sanitized hint, or a timestamp when
/// the hint is missing or sanitizes to nothing.
pub fn sound_name(hint: Option<&str>, max_len: usize, now: DateTime<Utc>) -> String {
    hint.map(|h| sanitize_name(h, max_len))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| fallback_name(now))
}

/// `<dir>/<name>.<ext>`, or `<name>_2`, `<name>_3`, ... if that is taken.
///
/// A path counts as taken when it exists on disk or is in `reserved`.
pub async fn unique_path(
    dir: &Path,
    name: &str,
    extension: &str,
    reserved: &HashSet<PathBuf>,
) -> PathBuf {
    let mut candidate = dir.join(format!("{}.{}", name, extension));
    let mut n = 2;

    while reserved.contains(&candidate)
        || tokio::fs::try_exists(&candidate).await.unwrap_or(false)
    {
        candidate = dir.join(format!("{}_{}.{}", name, n, extension));
        n += 1;
    }
    candidate
}

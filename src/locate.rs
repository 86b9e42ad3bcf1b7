//! Finding the file a transfer produced.
//!
//! yt-dlp does not always report the final name after post-processing, so the
//! output directory is listed before the transfer and compared afterwards,
//! with a title match as the last resort.

use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};

const FORBIDDEN_CHARS: [char; 11] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*', '？', '：'];

/// Names of the regular files currently in `dir`. A missing directory is empty.
pub async fn snapshot_dir(dir: &Path) -> std::io::Result<HashSet<String>> {
    let mut names = HashSet::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(names),
        Err(error) => return Err(error),
    };

    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        if entry.file_type().await?.is_file()
            && let Some(name) = file_name.to_str()
        {
            names.insert(name.to_string());
        }
    }

    Ok(names)
}

/// Resolves the produced file, trying in order: the path the tool reported,
/// files that appeared since `before` with the expected extension, and
/// existing files whose name matches the title.
pub async fn locate_output(
    dir: &Path,
    before: &HashSet<String>,
    extension: &str,
    title: &str,
    reported: Option<&Path>,
) -> std::io::Result<Option<PathBuf>> {
    let canonical_dir = tokio::fs::canonicalize(dir).await?;

    if let Some(path) = reported {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        if let Some(found) = resolve_candidate(&canonical_dir, &candidate).await? {
            debug!(path = ?found, "using path reported by yt-dlp");
            return Ok(Some(found));
        }
    }

    let after = snapshot_dir(dir).await?;
    let mut fresh: Vec<(SystemTime, PathBuf)> = Vec::new();
    for name in after.difference(before) {
        if !has_extension(name, extension) {
            continue;
        }
        let path = dir.join(name);
        if let Some(found) = resolve_candidate(&canonical_dir, &path).await? {
            let modified = tokio::fs::metadata(&found)
                .await?
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            fresh.push((modified, found));
        }
    }
    fresh.sort();
    if let Some((_, found)) = fresh.pop() {
        debug!(path = ?found, "found new file with expected extension");
        return Ok(Some(found));
    }

    let mut names: Vec<&String> = after.iter().filter(|name| has_extension(name, extension)).collect();
    names.sort();
    for name in names {
        if !title_matches(title, name) {
            continue;
        }
        if let Some(found) = resolve_candidate(&canonical_dir, &dir.join(name)).await? {
            info!(path = ?found, "found file by title matching");
            return Ok(Some(found));
        }
    }

    Ok(None)
}

/// Accepts a non-empty regular file inside `canonical_dir`.
async fn resolve_candidate(canonical_dir: &Path, candidate: &Path) -> std::io::Result<Option<PathBuf>> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error),
    };

    if !metadata.is_file() || metadata.len() == 0 {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await?;
    if !canonical.starts_with(canonical_dir) {
        warn!(path = ?canonical, "ignoring file outside the downloads directory");
        return Ok(None);
    }

    Ok(Some(canonical))
}

fn has_extension(name: &str, extension: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

fn clean(value: &str) -> String {
    value
        .chars()
        .filter(|c| !FORBIDDEN_CHARS.contains(c))
        .collect::<String>()
        .to_lowercase()
}

/// Whether `filename` plausibly belongs to a resource titled `title`.
///
/// Titles of three or more words need at least three, and a majority, of
/// their words longer than two characters to appear in the name. Shorter
/// titles must appear whole.
pub fn title_matches(title: &str, filename: &str) -> bool {
    let clean_title = clean(title);
    let clean_name = clean(filename);
    let words: Vec<&str> = clean_title.split_whitespace().collect();

    if words.is_empty() {
        return false;
    }

    if words.len() < 3 {
        return clean_name.contains(clean_title.trim());
    }

    let significant: Vec<&str> = words
        .into_iter()
        .filter(|word| word.chars().count() > 2)
        .collect();
    let matches = significant
        .iter()
        .filter(|word| clean_name.contains(**word))
        .count();

    matches >= 3 && matches * 2 > significant.len()
}

/// Deletes the directory holding job `id`'s output under `root`. A directory
/// that is already gone is not an error.
pub async fn remove_job_output(root: &Path, id: &str) {
    let job_dir = root.join(id);
    match tokio::fs::remove_dir_all(&job_dir).await {
        Ok(()) => debug!(path = ?job_dir, "removed job output"),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!("could not remove job output {:?}: {error}", job_dir),
    }
}

/// Removes files and directories in `dir` not modified for `max_age`.
pub async fn cleanup_stale_files(dir: &Path, max_age: Duration) -> usize {
    if max_age.is_zero() {
        return 0;
    }

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("could not open downloads directory for cleanup: {error}");
            }
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("could not iterate downloads directory for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };

        match result {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("could not remove stale download {:?}: {error}", path),
        }
    }

    removed
}

//! Artifact discovery over the toolchain's output tree.
//!
//! The renderer decides its own directory layout (quality folders, partial
//! movie caches), so the only reliable contract is the job id embedded in
//! the artifact filename. Traversal is depth-first in directory-listing
//! order and the first match is canonical — an explicit, non-alphabetic
//! tie-break the orchestrator relies on.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::fs;

use crate::domain::job::JobId;

/// Collect every file under `root` whose name contains the job id and ends
/// with the expected extension. A missing root yields an empty list rather
/// than an error; the caller treats "nothing found" as its own condition.
pub async fn find_artifacts(
    root: &Path,
    job_id: &JobId,
    extension: &str,
) -> std::io::Result<Vec<PathBuf>> {
    let needle = job_id.as_str().to_string();
    let suffix = format!(".{}", extension.trim_start_matches('.'));
    match walk(root.to_path_buf(), needle, suffix).await {
        Ok(matches) => Ok(matches),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

fn walk(
    dir: PathBuf,
    needle: String,
    suffix: String,
) -> BoxFuture<'static, std::io::Result<Vec<PathBuf>>> {
    async move {
        let mut matches = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                matches.extend(walk(path, needle.clone(), suffix.clone()).await?);
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains(&needle) && name.ends_with(&suffix) {
                matches.push(path);
            }
        }
        Ok(matches)
    }
    .boxed()
}

/// Flat listing of the top level of `root`, captured for the diagnostics of
/// a search that came up empty. Best-effort: unreadable directories report
/// themselves as such instead of failing the listing.
pub async fn flat_listing(root: &Path) -> Vec<String> {
    let mut names = Vec::new();
    match fs::read_dir(root).await {
        Ok(mut entries) => {
            while let Ok(Some(entry)) = entries.next_entry().await {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Err(err) => names.push(format!("<unreadable output directory: {err}>")),
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn finds_artifact_nested_two_levels_deep() {
        let dir = TempDir::new().expect("temp dir");
        let nested = dir.path().join("media/videos");
        fs::create_dir_all(&nested).await.expect("mkdir");
        fs::write(nested.join("scene_123.mp4"), b"")
            .await
            .expect("write");
        fs::write(dir.path().join("scene_123.log"), b"")
            .await
            .expect("write");

        let job_id = JobId::from_millis(123);
        let matches = find_artifacts(dir.path(), &job_id, "mp4")
            .await
            .expect("search");
        assert_eq!(matches.len(), 1);
        assert!(matches[0].is_file());
        assert!(matches[0].ends_with("media/videos/scene_123.mp4"));
    }

    #[tokio::test]
    async fn absent_match_returns_empty_without_raising() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("scene_9.mp4"), b"")
            .await
            .expect("write");

        let job_id = JobId::from_millis(123);
        let matches = find_artifacts(dir.path(), &job_id, "mp4")
            .await
            .expect("search");
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn missing_root_is_treated_as_empty() {
        let dir = TempDir::new().expect("temp dir");
        let job_id = JobId::from_millis(1);
        let matches = find_artifacts(&dir.path().join("never-created"), &job_id, "mp4")
            .await
            .expect("search");
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn extension_must_match_exactly() {
        let dir = TempDir::new().expect("temp dir");
        fs::write(dir.path().join("scene_7.mp4.partial"), b"")
            .await
            .expect("write");

        let job_id = JobId::from_millis(7);
        let matches = find_artifacts(dir.path(), &job_id, "mp4")
            .await
            .expect("search");
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn flat_listing_names_top_level_entries() {
        let dir = TempDir::new().expect("temp dir");
        fs::create_dir(dir.path().join("media")).await.expect("mkdir");
        fs::write(dir.path().join("other.txt"), b"")
            .await
            .expect("write");

        let mut listing = flat_listing(dir.path()).await;
        listing.sort();
        assert_eq!(listing, vec!["media".to_string(), "other.txt".to_string()]);
    }
}

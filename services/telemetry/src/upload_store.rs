use crate::config::StorageConfig;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Extension given to every stored picture.
pub const PICTURE_EXTENSION: &str = "jpeg";

/// Errors raised while writing pictures to disk.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A picture that has been written to the uploads root.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPicture {
    /// Public URL the picture is served under
    pub url: String,
    /// Location on disk
    pub path: PathBuf,
}

/// Writes pictures into date-partitioned folders under the uploads root.
///
/// Layout: `{uploads_root}/{YYYY-MM-DD}/{16 hex chars}.jpeg`, served as
/// `{url_prefix}/{YYYY-MM-DD}/{16 hex chars}.jpeg`.
pub struct UploadStore {
    root: PathBuf,
    url_prefix: String,
}

impl UploadStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.uploads_root.clone(),
            url_prefix: config.url_prefix.trim_end_matches('/').to_string(),
        }
    }

    /// Create the uploads root if it does not exist yet
    pub async fn init(&self) -> Result<(), UploadError> {
        create_dir(&self.root).await?;
        info!(root = %self.root.display(), "Uploads root ready");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    /// Write a picture into today's folder
    pub async fn store_picture(&self, bytes: &[u8]) -> Result<StoredPicture, UploadError> {
        self.store_picture_at(bytes, Utc::now()).await
    }

    /// Write a picture into the folder for `now`'s UTC date
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub async fn store_picture_at(
        &self,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<StoredPicture, UploadError> {
        let directory = date_directory(now);
        let file_name = format!("{}.{}", generate_file_name(), PICTURE_EXTENSION);

        let dir_path = self.root.join(&directory);
        create_dir(&dir_path).await?;

        let path = dir_path.join(&file_name);
        write_file(&path, bytes).await?;

        let url = format!("{}/{}/{}", self.url_prefix, directory, file_name);

        debug!(path = %path.display(), url = %url, "Picture written");

        Ok(StoredPicture { url, path })
    }
}

/// Random file stem: 8 bytes from the OS generator, hex encoded.
pub fn generate_file_name() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Folder name for a point in time: its UTC calendar date, `YYYY-MM-DD`.
pub fn date_directory(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Write `bytes` to `path`. A file left behind by a failed write is removed.
async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), UploadError> {
    if let Err(source) = tokio::fs::write(path, bytes).await {
        error!(path = %path.display(), error = %source, "Failed to write picture");
        discard_partial(path).await;
        return Err(UploadError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => warn!(path = %path.display(), "Removed partially written picture"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            path = %path.display(),
            error = %e,
            "Partially written picture could not be removed"
        ),
    }
}

/// `create_dir_all` succeeds when the directory already exists, including
/// when another request created it a moment earlier.
async fn create_dir(path: &Path) -> Result<(), UploadError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| UploadError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn store_in(dir: &Path) -> UploadStore {
        UploadStore::new(&StorageConfig {
            uploads_root: dir.to_path_buf(),
            url_prefix: "/uploads/".to_string(),
        })
    }

    #[test]
    fn test_file_name_is_16_hex_chars() {
        let name = generate_file_name();
        assert_eq!(name.len(), 16);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_file_names_do_not_collide() {
        let names: HashSet<String> = (0..100).map(|_| generate_file_name()).collect();
        assert_eq!(names.len(), 100);
    }

    #[test]
    fn test_date_directory() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 59).unwrap();
        let directory = date_directory(now);
        assert_eq!(directory, "2024-01-15");
        assert_eq!(directory.len(), 10);
    }

    #[tokio::test]
    async fn test_store_picture_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap();

        let stored = store.store_picture_at(b"jpeg bytes", now).await.unwrap();

        assert!(stored.url.starts_with("/uploads/2024-01-15/"));
        assert!(stored.url.ends_with(".jpeg"));
        assert_eq!(stored.path.parent().unwrap(), dir.path().join("2024-01-15"));
        assert_eq!(std::fs::read(&stored.path).unwrap(), b"jpeg bytes");

        let stem = stored.path.file_stem().unwrap().to_str().unwrap();
        assert_eq!(stem.len(), 16);
    }

    #[tokio::test]
    async fn test_concurrent_first_writes_of_the_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(dir.path()));
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let writes = (0..16).map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.store_picture_at(&[i as u8], now).await })
        });

        let results = futures::future::join_all(writes).await;
        let paths: HashSet<PathBuf> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap().path)
            .collect();

        assert_eq!(paths.len(), 16);
        assert_eq!(std::fs::read_dir(dir.path().join("2024-03-01")).unwrap().count(), 16);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the uploads root should be
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let store = store_in(&blocker);

        let err = store.store_picture(b"bytes").await.unwrap_err();
        assert!(matches!(err, UploadError::CreateDir { .. }));
    }

    #[tokio::test]
    async fn test_file_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the picture file should be
        let target = dir.path().join("0123456789abcdef.jpeg");
        std::fs::create_dir(&target).unwrap();

        let err = write_file(&target, b"bytes").await.unwrap_err();

        assert!(matches!(err, UploadError::Write { ref path, .. } if *path == target));
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn test_partial_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("0123456789abcdef.jpeg");
        std::fs::write(&partial, b"\xFF\xD8").unwrap();

        discard_partial(&partial).await;
        assert!(!partial.exists());

        // Nothing to remove
        discard_partial(&partial).await;
        assert!(!partial.exists());
    }
}

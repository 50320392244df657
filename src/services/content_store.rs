//! src/services/content_store.rs
//!
//! ContentStore: the on-disk home of uploaded files and generated metadata
//! documents. Paths are relative to `root` and always use `/` separators:
//! `uploads/{accession}/{filename}` for donor files and
//! `metadata/{accession}/metadata.txt` for the generated summary.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_PATH_LEN: usize = 1024;

/// Name of the generated document, both on disk and inside archives.
pub const METADATA_FILENAME: &str = "metadata.txt";

#[derive(Clone, Debug)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable relative path of an uploaded file.
    pub fn upload_path(accession_id: i64, filename: &str) -> String {
        format!("uploads/{}/{}", accession_id, filename)
    }

    /// Directory holding every upload of one accession.
    pub fn upload_dir(accession_id: i64) -> String {
        format!("uploads/{}", accession_id)
    }

    /// Where the metadata document for an accession is written.
    ///
    /// Kept outside `uploads/` so a donor file called `metadata.txt` is never
    /// overwritten.
    pub fn metadata_path(accession_id: i64) -> String {
        format!("{}/{}", Self::metadata_dir(accession_id), METADATA_FILENAME)
    }

    pub fn metadata_dir(accession_id: i64) -> String {
        format!("metadata/{}", accession_id)
    }

    /// Map a relative store path onto the filesystem.
    ///
    /// Rejects empty or absolute paths, `..` components, backslashes and
    /// control characters.
    pub fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let invalid = || io::Error::new(ErrorKind::InvalidInput, format!("invalid store path `{path}`"));

        if path.is_empty() || path.len() > MAX_PATH_LEN || path.starts_with('/') {
            return Err(invalid());
        }
        if path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(invalid());
        }
        if path.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            return Err(invalid());
        }

        let mut full = self.root.clone();
        full.extend(path.split('/'));
        Ok(full)
    }

    /// Open a stored file for reading.
    pub async fn open(&self, path: &str) -> io::Result<File> {
        File::open(self.resolve(path)?).await
    }

    /// Write `bytes` to `path`, replacing any previous content atomically.
    ///
    /// Data goes to a temp file in the same directory, is fsynced, then
    /// renamed over the target. Readers see either the old or the new file.
    pub async fn write_atomic(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("store path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = write_and_sync(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &target).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        debug!("wrote {} bytes to {}", bytes.len(), target.display());
        Ok(())
    }

    /// Recursively delete a directory. A missing directory is not an error.
    pub async fn remove_dir(&self, path: &str) -> io::Result<()> {
        let dir = self.resolve(path)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("removed directory {}", dir.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

async fn write_and_sync(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn builds_stable_paths() {
        assert_eq!(ContentStore::upload_path(42, "file1.txt"), "uploads/42/file1.txt");
        assert_eq!(ContentStore::metadata_path(42), "metadata/42/metadata.txt");
    }

    #[test]
    fn rejects_traversal_and_absolute_paths() {
        let store = ContentStore::new("/srv/media");
        for bad in ["", "/etc/passwd", "uploads/../secret", "uploads//x", "a\\b", "./x"] {
            let err = store.resolve(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{bad:?}");
        }
        assert_eq!(
            store.resolve("uploads/1/a.txt").unwrap(),
            PathBuf::from("/srv/media/uploads/1/a.txt")
        );
    }

    #[tokio::test]
    async fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());

        store.write_atomic("metadata/1/metadata.txt", b"first").await.unwrap();
        store.write_atomic("metadata/1/metadata.txt", b"second").await.unwrap();

        let mut contents = String::new();
        store
            .open("metadata/1/metadata.txt")
            .await
            .unwrap()
            .read_to_string(&mut contents)
            .await
            .unwrap();
        assert_eq!(contents, "second");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("metadata/1"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn remove_dir_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        store.remove_dir("uploads/99").await.unwrap();

        store.write_atomic("uploads/3/a.bin", b"x").await.unwrap();
        store.remove_dir("uploads/3").await.unwrap();
        assert!(!dir.path().join("uploads/3").exists());
    }
}

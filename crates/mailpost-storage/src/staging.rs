//! File-backed staging store

use mailpost_common::config::StagingConfig;
use mailpost_common::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// Number of random bytes in a staging identifier (160 bits)
const STAGING_ID_BYTES: usize = 20;

/// Random identifier of one staged message, rendered as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StagingId(String);

impl StagingId {
    /// Generate a fresh identifier
    pub fn generate() -> Self {
        let bytes: [u8; STAGING_ID_BYTES] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StagingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Staging directory holding one file per in-flight message
#[derive(Debug, Clone)]
pub struct StagingStore {
    base_path: PathBuf,
}

impl StagingStore {
    /// Create a staging store from config
    pub fn new(config: &StagingConfig) -> Result<Self> {
        Self::from_path(&config.tmp)
    }

    /// Create a staging store rooted at `path`, creating the directory if needed
    pub fn from_path(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Staging(format!("Failed to create staging directory: {}", e)))?;

        info!(path = %path.display(), "Initialized staging directory");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    /// Directory backing this store
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Location of the artifact for `id`
    pub fn path_for(&self, id: &StagingId) -> PathBuf {
        self.base_path.join(format!("{}.eml", id))
    }

    /// Create a new artifact and open it for writing
    pub async fn begin(&self, id: &StagingId) -> Result<StagingWriter> {
        // The directory may have been removed since startup
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| Error::Staging(format!("Failed to create staging directory: {}", e)))?;

        let path = self.path_for(id);
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| Error::Staging(format!("Failed to create staging file: {}", e)))?;

        debug!(staging_id = %id, path = %path.display(), "Created staging file");

        Ok(StagingWriter {
            id: id.clone(),
            path,
            file: BufWriter::new(file),
            size: 0,
        })
    }

    /// Remove artifacts left behind by an earlier process.
    ///
    /// Call before the listener starts; files of live sessions would be lost.
    pub async fn sweep(&self) -> Result<usize> {
        let mut entries = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| Error::Staging(format!("Failed to read staging directory: {}", e)))?;

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Staging(format!("Failed to read staging directory: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("eml") {
                continue;
            }

            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), "Failed to remove stale staging file: {}", e),
            }
        }

        if removed > 0 {
            info!(removed, "Removed stale staging files");
        }

        Ok(removed)
    }

    /// Remove the artifact for `id`.
    ///
    /// Returns `Ok(false)` when the artifact was already gone; that case is
    /// logged and otherwise harmless.
    pub async fn dispose(&self, id: &StagingId) -> Result<bool> {
        let path = self.path_for(id);

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(staging_id = %id, "Disposed staging file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(staging_id = %id, "Staging file already removed");
                Ok(false)
            }
            Err(e) => Err(Error::Staging(format!(
                "Failed to delete staging file {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Open write handle on one staging artifact
#[derive(Debug)]
pub struct StagingWriter {
    id: StagingId,
    path: PathBuf,
    file: BufWriter<fs::File>,
    size: u64,
}

impl StagingWriter {
    /// Append raw bytes in arrival order
    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .await
            .map_err(|e| Error::Staging(format!("Failed to write staging file: {}", e)))?;
        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Close the writer and expose the artifact for reading
    pub async fn finalize(mut self) -> Result<StagedMessage> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::Staging(format!("Failed to flush staging file: {}", e)))?;
        self.file
            .get_mut()
            .sync_all()
            .await
            .map_err(|e| Error::Staging(format!("Failed to sync staging file: {}", e)))?;

        debug!(staging_id = %self.id, size = self.size, "Finalized staging file");

        Ok(StagedMessage {
            path: self.path,
            size: self.size,
        })
    }
}

/// A fully written staging artifact
#[derive(Debug, Clone)]
pub struct StagedMessage {
    path: PathBuf,
    size: u64,
}

impl StagedMessage {
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Open the artifact for sequential reading
    pub async fn open(&self) -> Result<fs::File> {
        fs::File::open(&self.path)
            .await
            .map_err(|e| Error::Staging(format!("Failed to open staging file: {}", e)))
    }

    /// Read the whole artifact
    pub async fn read(&self) -> Result<Vec<u8>> {
        let mut file = self.open().await?;
        let mut data = Vec::with_capacity(self.size as usize);
        file.read_to_end(&mut data)
            .await
            .map_err(|e| Error::Staging(format!("Failed to read staging file: {}", e)))?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[test]
    fn test_staging_id_format_and_uniqueness() {
        let ids: HashSet<String> = (0..10_000)
            .map(|_| StagingId::generate().to_string())
            .collect();
        assert_eq!(ids.len(), 10_000);

        let id = StagingId::generate();
        assert_eq!(id.as_str().len(), STAGING_ID_BYTES * 2);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_stage_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = StagingStore::from_path(temp_dir.path()).unwrap();
        let id = StagingId::generate();

        let mut writer = store.begin(&id).await.unwrap();
        writer.append(b"Subject: hi\r\n").await.unwrap();
        writer.append(b"\r\n").await.unwrap();
        writer.append(b"body\r\n").await.unwrap();

        let staged = writer.finalize().await.unwrap();
        assert_eq!(staged.size(), 21);
        assert_eq!(staged.read().await.unwrap(), b"Subject: hi\r\n\r\nbody\r\n");
        assert!(store.path_for(&id).exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let store = StagingStore::from_path(temp_dir.path()).unwrap();

        for _ in 0..2 {
            let mut writer = store.begin(&StagingId::generate()).await.unwrap();
            writer.append(b"Subject: interrupted\r\n").await.unwrap();
            drop(writer);
        }
        std::fs::write(temp_dir.path().join("notes.txt"), b"keep").unwrap();

        assert_eq!(store.sweep().await.unwrap(), 2);
        let left: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from("notes.txt")]);

        assert_eq!(store.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = StagingStore::from_path(temp_dir.path()).unwrap();
        let id = StagingId::generate();

        let writer = store.begin(&id).await.unwrap();
        writer.finalize().await.unwrap();

        assert!(store.dispose(&id).await.unwrap());
        assert!(!store.path_for(&id).exists());
        assert!(!store.dispose(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_begin_recreates_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("spool");
        let store = StagingStore::from_path(&base).unwrap();
        std::fs::remove_dir_all(&base).unwrap();

        let id = StagingId::generate();
        let writer = store.begin(&id).await.unwrap();
        writer.finalize().await.unwrap();
        assert!(base.join(format!("{}.eml", id)).exists());
    }

    #[tokio::test]
    async fn test_begin_fails_when_directory_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("spool");
        let store = StagingStore::from_path(&base).unwrap();

        // Replace the directory with a plain file so it cannot be recreated
        std::fs::remove_dir_all(&base).unwrap();
        std::fs::write(&base, b"not a directory").unwrap();

        let result = store.begin(&StagingId::generate()).await;
        assert!(matches!(result, Err(Error::Staging(_))));
    }

    #[tokio::test]
    async fn test_begin_refuses_existing_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let store = StagingStore::from_path(temp_dir.path()).unwrap();
        let id = StagingId::generate();

        let _writer = store.begin(&id).await.unwrap();
        assert!(store.begin(&id).await.is_err());
    }
}

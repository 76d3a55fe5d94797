use super::{ByteStore, ByteStoreError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sketchdb_config::Configurable;
use sketchdb_error::SketchDbError;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const FILE_PREFIX: &str = "k-";
const TMP_SUFFIX: &str = ".tmp";
// File names are capped at 255 bytes on common filesystems and each key byte
// takes two hex digits.
pub const MAX_KEY_LEN: usize = (255 - FILE_PREFIX.len() - TMP_SUFFIX.len()) / 2;

#[derive(Deserialize, Serialize, Debug, Clone)]
/// The configuration for the local byte store
/// # Fields
/// - root: The directory holding one file per key.
pub struct LocalByteStoreConfig {
    pub root: String,
}

/// A byte store keeping one file per key under a root directory.
///
/// File names are the hex encoding of the key, so directory order is not key
/// order; an in-memory key set, rebuilt from the directory listing on open,
/// serves the ordered scans. Writes go through a temporary file and a
/// rename so a crash never leaves a half-written value behind.
#[derive(Clone, Debug)]
pub struct LocalByteStore {
    root: PathBuf,
    keys: Arc<RwLock<BTreeSet<Vec<u8>>>>,
}

fn io_error(path: &Path, source: std::io::Error) -> ByteStoreError {
    ByteStoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl LocalByteStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, ByteStoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| io_error(&root, e))?;

        let mut keys = BTreeSet::new();
        let mut dir = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| io_error(&root, e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&root, e))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                tracing::warn!(file = name, "Removing interrupted write");
                let path = entry.path();
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| io_error(&path, e))?;
                continue;
            }
            match name.strip_prefix(FILE_PREFIX).map(hex::decode) {
                Some(Ok(key)) => {
                    keys.insert(key);
                }
                _ => tracing::warn!(file = name, "Ignoring foreign file in byte store root"),
            }
        }
        tracing::info!(root = %root.display(), keys = keys.len(), "Opened local byte store");

        Ok(LocalByteStore {
            root,
            keys: Arc::new(RwLock::new(keys)),
        })
    }

    fn check_key(key: &[u8]) -> Result<(), ByteStoreError> {
        if key.len() > MAX_KEY_LEN {
            return Err(ByteStoreError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        Ok(())
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        self.root
            .join(format!("{}{}", FILE_PREFIX, hex::encode(key)))
    }

    async fn read_existing(&self, key: &[u8]) -> Result<Option<Bytes>, ByteStoreError> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn read_all(&self, keys: Vec<Vec<u8>>) -> Result<Vec<(Vec<u8>, Bytes)>, ByteStoreError> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            // A concurrent delete can remove the file after the key set was read.
            if let Some(value) = self.read_existing(&key).await? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl ByteStore for LocalByteStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, ByteStoreError> {
        if !self.keys.read().contains(key) {
            return Ok(None);
        }
        self.read_existing(key).await
    }

    async fn put(&self, key: &[u8], value: Bytes) -> Result<(), ByteStoreError> {
        Self::check_key(key)?;
        let path = self.path_for(key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        tracing::trace!(path = %path.display(), len = value.len(), "Writing key");
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;
        self.keys.write().insert(key.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, ByteStoreError> {
        let path = self.path_for(key);
        let existed = self.keys.write().remove(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(existed),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn range_scan(
        &self,
        low: &[u8],
        high: &[u8],
    ) -> Result<Vec<(Vec<u8>, Bytes)>, ByteStoreError> {
        if low > high {
            return Ok(Vec::new());
        }
        let keys: Vec<Vec<u8>> = self
            .keys
            .read()
            .range::<[u8], _>((Bound::Included(low), Bound::Included(high)))
            .cloned()
            .collect();
        self.read_all(keys).await
    }

    async fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Bytes)>, ByteStoreError> {
        let keys = self.scan_keys(prefix).await?;
        self.read_all(keys).await
    }

    async fn scan_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, ByteStoreError> {
        Ok(self
            .keys
            .read()
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn size(&self) -> Result<usize, ByteStoreError> {
        Ok(self.keys.read().len())
    }
}

#[async_trait]
impl Configurable<LocalByteStoreConfig> for LocalByteStore {
    async fn try_from_config(
        config: &LocalByteStoreConfig,
    ) -> Result<Self, Box<dyn SketchDbError>> {
        LocalByteStore::open(&config.root).await.map_err(|e| e.boxed())
    }
}

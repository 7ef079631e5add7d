use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use synccore::store::error::{Result, StoreError};
use synccore::store::traits::CacheBackend;
use tokio::fs;

const ENTRY_EXTENSION: &str = "json";

/// One file per cache key under a base directory.
///
/// Values are written to a temporary file and renamed into place, so a reader
/// never observes a half-written entry.
pub struct FileCacheBackend {
    base_path: PathBuf,
}

impl FileCacheBackend {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    // Keys are reversible: '%' escapes every byte outside [A-Za-z0-9.-_].
    fn sanitize_filename(key: &str) -> String {
        let mut out = String::with_capacity(key.len());
        for b in key.bytes() {
            if b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_' {
                out.push(b as char);
            } else {
                out.push('%');
                out.push_str(&hex::encode([b]));
            }
        }
        out
    }

    fn restore_key(filename: &str) -> Option<String> {
        let mut bytes = Vec::with_capacity(filename.len());
        let mut iter = filename.bytes();
        while let Some(b) = iter.next() {
            if b == b'%' {
                let pair = [iter.next()?, iter.next()?];
                let decoded = hex::decode(pair).ok()?;
                bytes.extend(decoded);
            } else {
                bytes.push(b);
            }
        }
        String::from_utf8(bytes).ok()
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{ENTRY_EXTENSION}", Self::sanitize_filename(key)))
    }
}

#[async_trait]
impl CacheBackend for FileCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value).await?;
        fs::rename(&tmp, &path).await.map_err(StoreError::Io)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        fs::remove_file(self.path_for(key))
            .await
            .or_else(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(StoreError::from)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(Self::restore_key)
            else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

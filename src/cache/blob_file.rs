//! one-file-per-entry durable cache.
//!
//! layout: `<root>/<name>/<sha>`. each file holds the serialized entry and is written
//! to a temporary sibling first, then renamed into place, so readers in this or any
//! other process never see a partial file.
use async_std::fs;
use async_std::io::prelude::WriteExt;
use async_std::stream::StreamExt;
use log::*;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::CacheEntry;
use crate::error::CacheError;

const TEMP_PREFIX: &str = ".";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
pub struct BlobFileCache {
    name: String,
    dir: PathBuf,
}

impl BlobFileCache {
    /// the directory is created on first `set`, never here
    pub fn new(root: impl AsRef<Path>, name: &str) -> BlobFileCache {
        BlobFileCache {
            name: name.to_string(),
            dir: root.as_ref().join(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn get_entry(&self, sha: &str) -> Option<CacheEntry> {
        let path = self.dir.join(sha);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("cache read failed for {}, treating as miss: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<CacheEntry>(&text) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("skipping malformed cache file {}: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn set_entry(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(&entry)?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::write(&self.dir, e))?;

        let path = self.dir.join(&entry.sha);
        let temp = self.temp_path(&entry.sha);

        if let Err(e) = write_file(&temp, &bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::write(&temp, e));
        }

        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(CacheError::write(&path, e));
        }

        debug!("blob cache {} wrote {}", self.name, path.display());
        Ok(())
    }

    /// every readable entry in the directory; temp files and malformed files are skipped
    pub async fn values(&self) -> Vec<CacheEntry> {
        let mut list = vec![];

        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return list,
            Err(e) => {
                warn!("unable to list cache dir {}: {}", self.dir.display(), e);
                return list;
            }
        };

        while let Some(item) = dir.next().await {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!("unable to read cache dir entry: {}", e);
                    continue;
                }
            };

            let file_name = item.file_name();
            let Some(sha) = file_name.to_str() else {
                continue;
            };
            if sha.starts_with(TEMP_PREFIX) {
                continue;
            }

            if let Some(entry) = self.get_entry(sha).await {
                list.push(entry);
            }
        }

        list
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                info!("cleared blob cache: {}", self.dir.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Clear {
                path: self.dir.clone(),
                source: e,
            }),
        }
    }

    fn temp_path(&self, sha: &str) -> PathBuf {
        let nonce: String = std::iter::repeat_with(fastrand::alphanumeric)
            .take(8)
            .collect();
        self.dir
            .join(format!("{}{}.{}{}", TEMP_PREFIX, sha, nonce, TEMP_SUFFIX))
    }
}

async fn write_file(path: &PathBuf, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

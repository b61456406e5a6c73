//! one-file, line oriented durable cache.
//!
//! every `set` appends one json line `{"sha":..,"val":..}` to `<root>/<name>.jsonl`.
//! the file is replayed into memory on first access, later lines win. the file is
//! never rewritten or compacted, so it grows with every `set` until `clear`.
//!
//! a crash can leave a torn last line. replay skips it like any other malformed
//! line, and the next `set` starts on a fresh line so its record stays readable.
use async_std::fs::{self, File, OpenOptions};
use async_std::io::prelude::{ReadExt, SeekExt, WriteExt};
use async_std::io::SeekFrom;
use async_std::sync::Mutex;
use hashbrown::HashMap;
use log::*;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::CacheEntry;
use crate::error::CacheError;

#[derive(Debug)]
pub struct AppendLogCache {
    name: String,
    root: PathBuf,
    path: PathBuf,
    // None until the first access replays the file
    entries: Mutex<Option<HashMap<String, CacheEntry>>>,
}

impl AppendLogCache {
    /// no filesystem work happens here; the file is read on first access and
    /// created on first `set`
    pub fn new(root: impl AsRef<Path>, name: &str) -> AppendLogCache {
        let root = root.as_ref().to_path_buf();
        let path = root.join(format!("{}.jsonl", name));
        AppendLogCache {
            name: name.to_string(),
            root,
            path,
            entries: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get_entry(&self, sha: &str) -> Option<CacheEntry> {
        let mut guard = self.entries.lock().await;
        self.loaded(&mut guard).await.get(sha).cloned()
    }

    pub async fn set_entry(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut guard = self.entries.lock().await;
        let entries = self.loaded(&mut guard).await;

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CacheError::write(&self.root, e))?;

        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CacheError::write(&self.path, e))?;

        if ends_mid_line(&mut file)
            .await
            .map_err(|e| CacheError::write(&self.path, e))?
        {
            warn!("cache log {} ends in a torn line", self.path.display());
            line.insert(0, '\n');
        }

        // a single write per record keeps appends from other processes from interleaving
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| CacheError::write(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| CacheError::write(&self.path, e))?;

        entries.insert(entry.sha.clone(), entry);
        Ok(())
    }

    pub async fn values(&self) -> Vec<CacheEntry> {
        let mut guard = self.entries.lock().await;
        self.loaded(&mut guard).await.values().cloned().collect()
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        let mut guard = self.entries.lock().await;
        match fs::remove_file(&self.path).await {
            Ok(()) => info!("cleared append log cache: {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => (),
            Err(e) => {
                return Err(CacheError::Clear {
                    path: self.path.clone(),
                    source: e,
                })
            }
        }

        *guard = Some(HashMap::new());
        Ok(())
    }

    async fn loaded<'a>(
        &self,
        guard: &'a mut Option<HashMap<String, CacheEntry>>,
    ) -> &'a mut HashMap<String, CacheEntry> {
        if guard.is_none() {
            *guard = Some(self.replay().await);
        }

        guard.get_or_insert_with(HashMap::new)
    }

    async fn replay(&self) -> HashMap<String, CacheEntry> {
        let mut entries = HashMap::new();

        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return entries,
            Err(e) => {
                warn!(
                    "unable to read cache log {}, continuing uncached: {}",
                    self.path.display(),
                    e
                );
                return entries;
            }
        };

        // bytes, not text: one line with broken utf-8 must not hide the rest
        for (lineno, line) in bytes.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<CacheEntry>(line) {
                Ok(entry) => {
                    entries.insert(entry.sha.clone(), entry);
                }
                Err(e) => warn!(
                    "skipping malformed entry at {}:{}: {}",
                    self.path.display(),
                    lineno + 1,
                    e
                ),
            }
        }

        info!(
            "replayed {} entries from {}",
            entries.len(),
            self.path.display()
        );

        entries
    }
}

// true when the file is non-empty and its last byte is not a newline
async fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1)).await?;
    file.read_exact(&mut last).await?;

    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(sha: &str, val: serde_json::Value) -> CacheEntry {
        CacheEntry::new(sha.to_string(), val)
    }

    #[test]
    fn new_does_not_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested");
        let cache = AppendLogCache::new(&root, "lazy");
        assert!(!root.exists());
        assert_eq!(cache.name(), "lazy");
    }

    #[test]
    fn last_line_wins_after_reload() {
        async_std::task::block_on(async move {
            let dir = tempfile::tempdir().unwrap();

            let cache = AppendLogCache::new(dir.path(), "log");
            cache.set_entry(entry("k", json!("v1"))).await.unwrap();
            cache.set_entry(entry("k", json!("v2"))).await.unwrap();
            assert_eq!(cache.get_entry("k").await.unwrap().val, json!("v2"));

            let text = std::fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
            assert_eq!(text.lines().count(), 2);

            let reloaded = AppendLogCache::new(dir.path(), "log");
            assert_eq!(reloaded.get_entry("k").await.unwrap().val, json!("v2"));
            assert_eq!(reloaded.values().await.len(), 1);
        });
    }

    #[test]
    fn malformed_lines_are_skipped() {
        async_std::task::block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("broken.jsonl");
            std::fs::write(
                &path,
                "{\"sha\":\"a\",\"val\":1}\nnot json\n\n{\"sha\":\"b\",\"val\":2}\n{\"sha\":\"c\",\"va",
            )
            .unwrap();

            let cache = AppendLogCache::new(dir.path(), "broken");
            assert_eq!(cache.get_entry("a").await.unwrap().val, json!(1));
            assert_eq!(cache.get_entry("b").await.unwrap().val, json!(2));
            assert!(cache.get_entry("c").await.is_none());
            assert_eq!(cache.values().await.len(), 2);
        });
    }

    #[test]
    fn set_after_torn_tail_starts_a_new_line() {
        async_std::task::block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("torn.jsonl");
            std::fs::write(&path, "{\"sha\":\"a\",\"val\":1}\n{\"sha\":\"b\",\"va").unwrap();

            let cache = AppendLogCache::new(dir.path(), "torn");
            cache.set_entry(entry("new", json!("fresh"))).await.unwrap();
            cache.set_entry(entry("next", json!(2))).await.unwrap();

            let text = std::fs::read_to_string(&path).unwrap();
            assert_eq!(text.lines().count(), 4);
            assert!(text.ends_with('\n'));

            let reloaded = AppendLogCache::new(dir.path(), "torn");
            assert_eq!(reloaded.get_entry("a").await.unwrap().val, json!(1));
            assert!(reloaded.get_entry("b").await.is_none());
            assert_eq!(reloaded.get_entry("new").await.unwrap().val, json!("fresh"));
            assert_eq!(reloaded.get_entry("next").await.unwrap().val, json!(2));
        });
    }

    #[test]
    fn invalid_utf8_only_costs_its_own_line() {
        async_std::task::block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let mut bytes = b"{\"sha\":\"a\",\"val\":1}\n{\"sha\":\"b\",\"val\":\"".to_vec();
            // a multi-byte character cut in half
            bytes.extend_from_slice(&[0xE2, 0x82]);
            bytes.extend_from_slice(b"\n{\"sha\":\"c\",\"val\":3}\n");
            std::fs::write(dir.path().join("bytes.jsonl"), bytes).unwrap();

            let cache = AppendLogCache::new(dir.path(), "bytes");
            assert_eq!(cache.get_entry("a").await.unwrap().val, json!(1));
            assert!(cache.get_entry("b").await.is_none());
            assert_eq!(cache.get_entry("c").await.unwrap().val, json!(3));
        });
    }

    #[test]
    fn clear_removes_the_log() {
        async_std::task::block_on(async move {
            let dir = tempfile::tempdir().unwrap();
            let cache = AppendLogCache::new(dir.path(), "gone");

            // clearing a cache that never wrote is fine
            cache.clear().await.unwrap();

            cache.set_entry(entry("k", json!(true))).await.unwrap();
            assert!(dir.path().join("gone.jsonl").exists());

            cache.clear().await.unwrap();
            assert!(!dir.path().join("gone.jsonl").exists());
            assert!(cache.get_entry("k").await.is_none());

            let reloaded = AppendLogCache::new(dir.path(), "gone");
            assert!(reloaded.values().await.is_empty());
        });
    }
}

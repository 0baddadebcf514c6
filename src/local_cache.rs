//! File-backed key-value mirror of device-local storage: settings toggles and cached profiles.
//!
//! Entries are kept in memory and every write is appended to the backing file as a single line, either
//! `set <key> <json>` or `del <key>`.  On open the file is replayed in order, so the last write for a key wins, and
//! then rewritten to hold only the live entries.  Writes that would not change an entry are not appended.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use fnv::FnvHashMap as HashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::{sync::RwLock, task::spawn_blocking};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, String>;

    async fn set(&self, key: &str, value: String) -> Result<(), String>;

    async fn remove(&self, key: &str) -> Result<(), String>;
}

pub async fn get_json<T: DeserializeOwned>(kv: &dyn KeyValueStore, key: &str) -> Result<Option<T>, String> {
    let Some(raw) = kv.get(key).await? else {
        return Ok(None);
    };

    serde_json::from_str(&raw).map(Some).map_err(|err| -> String {
        error!("Error decoding cached value for key {}: {:?}", key, err);
        format!("Corrupt cached value for key {}", key)
    })
}

pub async fn set_json<T: Serialize + ?Sized>(kv: &dyn KeyValueStore, key: &str, value: &T) -> Result<(), String> {
    let raw = serde_json::to_string(value).map_err(|err| -> String {
        error!("Error encoding value for key {}: {:?}", key, err);
        "Error encoding value".into()
    })?;
    kv.set(key, raw).await
}

enum Op<'a> {
    Set(&'a str, &'a str),
    Del(&'a str),
}

fn set_line(key: &str, value: &str) -> String { format!("set {} {}\n", key, value) }

fn parse_line(line: &str) -> Option<Op<'_>> {
    let (op, rest) = line.split_once(' ')?;
    match op {
        "set" => {
            let (key, value) = rest.split_once(' ')?;
            Some(Op::Set(key, value))
        },
        "del" => Some(Op::Del(rest)),
        _ => None,
    }
}

pub struct LocalCache {
    path: PathBuf,
    /// Writers hold the write lock across the file append so that file order matches memory order
    entries: RwLock<HashMap<String, String>>,
}

impl LocalCache {
    /// Opens the cache at `path`, replaying any existing entries.  A missing file is an empty cache.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref().to_owned();
        let read_path = path.clone();
        let file_content = spawn_blocking(move || match std::fs::read_to_string(&read_path) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err),
        })
        .await
        .map_err(|err| -> String {
            error!("Error joining local cache read task: {:?}", err);
            "Error reading local cache".into()
        })?
        .map_err(|err| -> String {
            error!("Error reading local cache file {:?}: {:?}", path, err);
            "Error reading local cache".into()
        })?;

        let mut entries = HashMap::default();
        let mut skipped = 0usize;
        let mut line_count = 0usize;
        for line in file_content.lines().filter(|line| !line.is_empty()) {
            line_count += 1;
            match parse_line(line) {
                Some(Op::Set(key, value)) => {
                    entries.insert(key.to_owned(), value.to_owned());
                },
                Some(Op::Del(key)) => {
                    entries.remove(key);
                },
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!("Skipped {} malformed lines in local cache file {:?}", skipped, path);
        }
        info!("Loaded {} entries from local cache file {:?}", entries.len(), path);

        if line_count > entries.len() {
            Self::compact(&path, &entries).await?;
        }

        Ok(LocalCache {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Rewrites the file at `path` to hold one `set` line per entry, replacing it atomically.
    async fn compact(path: &Path, entries: &HashMap<String, String>) -> Result<(), String> {
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        let content: String = keys
            .into_iter()
            .map(|key| set_line(key, &entries[key]))
            .collect();

        let path = path.to_owned();
        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        let entry_count = entries.len();
        spawn_blocking({
            let path = path.clone();
            move || -> std::io::Result<()> {
                std::fs::write(&tmp_path, content)?;
                std::fs::rename(&tmp_path, &path)
            }
        })
        .await
        .map_err(|err| -> String {
            error!("Error joining local cache compaction task: {:?}", err);
            "Error compacting local cache".into()
        })?
        .map_err(|err| -> String {
            error!("Error compacting local cache file {:?}: {:?}", path, err);
            "Error compacting local cache".into()
        })?;
        info!("Compacted local cache file {:?} to {} entries", path, entry_count);
        Ok(())
    }

    /// Must be called with the `entries` write lock held.
    async fn append(&self, line: String) -> Result<(), String> {
        let path = self.path.clone();
        spawn_blocking(move || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(line.as_bytes())
        })
        .await
        .map_err(|err| -> String {
            error!("Error joining local cache write task: {:?}", err);
            "Error writing local cache".into()
        })?
        .map_err(|err| -> String {
            error!("Error writing local cache file {:?}: {:?}", self.path, err);
            "Error writing local cache".into()
        })
    }

    pub async fn entry_count(&self) -> usize { self.entries.read().await.len() }
}

fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("Invalid cache key {:?}", key));
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<String>, String> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), String> {
        validate_key(key)?;
        // Values are stored one per line
        let value = value.replace('\n', " ");

        let mut entries = self.entries.write().await;
        if entries.get(key) == Some(&value) {
            return Ok(());
        }
        self.append(set_line(key, &value)).await?;
        entries.insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), String> {
        validate_key(key)?;

        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) {
            return Ok(());
        }
        self.append(format!("del {}\n", key)).await?;
        entries.remove(key);
        Ok(())
    }
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, String> { (**self).get(key).await }

    async fn set(&self, key: &str, value: String) -> Result<(), String> { (**self).set(key, value).await }

    async fn remove(&self, key: &str) -> Result<(), String> { (**self).remove(key).await }
}

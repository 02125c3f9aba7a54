//! Durable key-value records.
//!
//! Each key maps to one field-named JSON document. Readers tolerate unknown
//! and missing fields through serde defaults on the record types, so a record
//! written by an older or newer build still loads.
//!
//! Writes go through a temp file in the same directory followed by an atomic
//! rename, under a store-wide write lock, so a crash or a concurrent writer
//! can never leave a half-written record behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StoreError;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn write_atomic(&self, key: &str, record: &Value) -> Result<(), StoreError>;
}

pub async fn read_record<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.read(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub async fn write_record<T: Serialize>(
    store: &dyn KvStore,
    key: &str,
    record: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(record)?;
    store.write_atomic(key, &value).await
}

/// One `<key>.json` file per record under a state directory.
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_key(key)))
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl KvStore for JsonFileStore {
    async fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn write_atomic(&self, key: &str, record: &Value) -> Result<(), StoreError> {
        let payload = serde_json::to_vec_pretty(record)?;
        let path = self.path_for(key);
        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || atomic_write(&path, &payload))
            .await
            .map_err(|err| StoreError::TaskJoin(err.to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// In-memory store for tests. Can be told to fail writes.
    #[derive(Default)]
    pub struct MemoryStore {
        records: Mutex<HashMap<String, Value>>,
        pub fail_writes: AtomicBool,
        pub writes: AtomicUsize,
    }

    impl MemoryStore {
        pub fn get(&self, key: &str) -> Option<Value> {
            self.records.lock().get(key).cloned()
        }
    }

    #[async_trait]
    impl KvStore for MemoryStore {
        async fn read(&self, key: &str) -> Result<Option<Value>, StoreError> {
            Ok(self.records.lock().get(key).cloned())
        }

        async fn write_atomic(&self, key: &str, record: &Value) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.records.lock().insert(key.to_string(), record.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        #[serde(default)]
        count: u32,
    }

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).await.unwrap();
        let got: Option<Sample> = read_record(&store, "absent").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn write_then_read_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::new(dir.path()).await.unwrap();
            let rec = Sample {
                name: "cursor".into(),
                count: 3,
            };
            write_record(&store, "feed_cursor.main", &rec).await.unwrap();
        }
        let store = JsonFileStore::new(dir.path()).await.unwrap();
        let got: Option<Sample> = read_record(&store, "feed_cursor.main").await.unwrap();
        assert_eq!(
            got,
            Some(Sample {
                name: "cursor".into(),
                count: 3
            })
        );
    }

    #[tokio::test]
    async fn unknown_fields_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).await.unwrap();
        store
            .write_atomic(
                "sample",
                &serde_json::json!({"name": "x", "added_later": true}),
            )
            .await
            .unwrap();
        let got: Option<Sample> = read_record(&store, "sample").await.unwrap();
        assert_eq!(
            got,
            Some(Sample {
                name: "x".into(),
                count: 0
            })
        );
    }

    #[tokio::test]
    async fn corrupt_record_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("bindings.json"), b"{not json").unwrap();
        let err = store.read("bindings").await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn concurrent_writes_leave_a_whole_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JsonFileStore::new(dir.path()).await.unwrap());
        let mut handles = Vec::new();
        for i in 0..16u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let rec = Sample {
                    name: format!("writer-{i}"),
                    count: i,
                };
                write_record(store.as_ref(), "shared", &rec).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let got: Option<Sample> = read_record(store.as_ref(), "shared").await.unwrap();
        let got = got.expect("record present");
        assert_eq!(got.name, format!("writer-{}", got.count));
    }

    #[test]
    fn keys_are_sanitized_to_file_names() {
        assert_eq!(sanitize_key("feed_cursor.https://x/y"), "feed_cursor.https___x_y");
    }
}

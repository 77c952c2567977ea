//! Object-store adapter.
//!
//! The engine persists everything through this narrow, synchronous surface:
//! whole-object puts (plain and conditional), ranged gets, size probes, and
//! prefix listing. `put_if_absent` is the only primitive with write-write
//! conflict semantics; the manifest layer builds its generation fencing on
//! top of it.

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryOptions {
    fn normalized(self) -> Self {
        Self {
            max_attempts: self.max_attempts.max(1),
            base_delay: if self.base_delay.is_zero() {
                Duration::from_millis(1)
            } else {
                self.base_delay
            },
        }
    }

    fn backoff_for_attempt(self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(8);
        let multiplier = 1u32 << shift;
        self.base_delay.saturating_mul(multiplier)
    }
}

pub trait ObjectStore: Send + Sync + 'static {
    fn put(&self, path: &str, data: Bytes) -> Result<()>;
    /// Writes the object only if `path` is vacant; `Error::AlreadyExists`
    /// otherwise.
    fn put_if_absent(&self, path: &str, data: Bytes) -> Result<()>;
    fn get(&self, path: &str) -> Result<Bytes>;
    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes>;
    fn len(&self, path: &str) -> Result<u64>;
    /// All object paths under `prefix`, sorted ascending.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read-only view of one object, handed to the SST decoder.
#[derive(Clone)]
pub struct ReadOnlyObject {
    store: Arc<dyn ObjectStore>,
    path: String,
}

impl ReadOnlyObject {
    pub fn new(store: Arc<dyn ObjectStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    pub fn len(&self) -> Result<u64> {
        self.store.len(&self.path)
    }

    pub fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        self.store.get_range(&self.path, range)
    }

    pub fn read(&self) -> Result<Bytes> {
        self.store.get(&self.path)
    }
}

/// Heap-backed store for tests and the demo binary.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: parking_lot::Mutex<BTreeMap<String, Bytes>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.objects.lock().insert(path.to_string(), data);
        Ok(())
    }

    fn put_if_absent(&self, path: &str, data: Bytes) -> Result<()> {
        let mut objects = self.objects.lock();
        if objects.contains_key(path) {
            return Err(Error::AlreadyExists);
        }
        objects.insert(path.to_string(), data);
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Bytes> {
        self.objects
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(path.to_string()))
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let data = self.get(path)?;
        let start = range.start as usize;
        let end = (range.end as usize).min(data.len());
        if start > data.len() {
            return Err(Error::object_store(format!(
                "range {}..{} out of bounds for {} byte object",
                range.start,
                range.end,
                data.len()
            )));
        }
        Ok(data.slice(start..end))
    }

    fn len(&self, path: &str) -> Result<u64> {
        Ok(self.get(path)?.len() as u64)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Filesystem-backed store. Objects become visible atomically: plain puts go
/// through a tmp file plus rename, conditional puts through a hard link so
/// an existing object makes the link fail instead of being replaced.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let clean = key.trim_start_matches('/');
        self.root.join(clean)
    }

    fn write_tmp(&self, path: &Path, data: &[u8]) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, data)?;
        Ok(tmp)
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let dest = self.key_path(path);
        let tmp = self.write_tmp(&dest, &data)?;
        std::fs::rename(&tmp, &dest)?;
        Ok(())
    }

    fn put_if_absent(&self, path: &str, data: Bytes) -> Result<()> {
        let dest = self.key_path(path);
        let tmp = self.write_tmp(&dest, &data)?;
        let linked = std::fs::hard_link(&tmp, &dest);
        let _ = std::fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(Error::AlreadyExists)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get(&self, path: &str) -> Result<Bytes> {
        match std::fs::read(self.key_path(path)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ObjectNotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let data = self.get(path)?;
        let start = range.start as usize;
        let end = (range.end as usize).min(data.len());
        if start > data.len() {
            return Err(Error::object_store(format!(
                "range {}..{} out of bounds for {} byte object",
                range.start,
                range.end,
                data.len()
            )));
        }
        Ok(data.slice(start..end))
    }

    fn len(&self, path: &str) -> Result<u64> {
        match std::fs::metadata(self.key_path(path)) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ObjectNotFound(path.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_start_matches('/');
        let mut files = Vec::new();
        collect_files_recursively(&self.root, &self.root, &mut files)?;
        files.retain(|f| f.starts_with(prefix) && !f.contains(".tmp."));
        files.sort();
        Ok(files)
    }
}

fn collect_files_recursively(root: &Path, path: &Path, out: &mut Vec<String>) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files_recursively(root, &path, out)?;
            continue;
        }

        let rel = path.strip_prefix(root).map_err(|_| {
            Error::object_store(format!("path {} escapes store root", path.display()))
        })?;
        out.push(rel.to_string_lossy().replace('\\', "/"));
    }
    Ok(())
}

/// Remote store bridged from the async `object_store` SDK, with bounded
/// exponential retry on transient failures.
pub struct RemoteObjectStore {
    inner: Arc<dyn object_store::ObjectStore>,
    runtime: tokio::runtime::Runtime,
    retry: RetryOptions,
}

impl RemoteObjectStore {
    pub fn new(inner: Arc<dyn object_store::ObjectStore>) -> Result<Self> {
        Self::with_retry_options(inner, RetryOptions::default())
    }

    pub fn with_retry_options(
        inner: Arc<dyn object_store::ObjectStore>,
        retry: RetryOptions,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::object_store)?;
        Ok(Self {
            inner,
            runtime,
            retry: retry.normalized(),
        })
    }

    fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send,
        F::Output: Send,
    {
        if tokio::runtime::Handle::try_current().is_ok() {
            std::thread::scope(|scope| {
                scope.spawn(|| self.runtime.block_on(future)).join()
            })
            .unwrap_or_else(|_| panic!("object store bridge thread panicked"))
        } else {
            self.runtime.block_on(future)
        }
    }

    fn with_retry<T>(
        &self,
        op_name: &str,
        mut op: impl FnMut() -> std::result::Result<T, object_store::Error>,
    ) -> Result<T> {
        let attempts = self.retry.max_attempts;
        let mut last_err = None;
        for attempt in 1..=attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(object_store::Error::NotFound { path, .. }) => {
                    return Err(Error::ObjectNotFound(path));
                }
                Err(object_store::Error::AlreadyExists { .. }) => {
                    return Err(Error::AlreadyExists);
                }
                Err(err) => {
                    last_err = Some(Error::object_store(format!(
                        "{op_name} attempt {attempt}/{attempts} failed: {err}"
                    )));
                    if attempt < attempts {
                        std::thread::sleep(self.retry.backoff_for_attempt(attempt));
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::object_store(format!("{op_name} failed without an error"))))
    }
}

impl ObjectStore for RemoteObjectStore {
    fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let location = object_store::path::Path::from(path);
        self.with_retry("put", || {
            self.block_on(async {
                self.inner
                    .put(&location, object_store::PutPayload::from(data.clone()))
                    .await
                    .map(|_| ())
            })
        })
    }

    fn put_if_absent(&self, path: &str, data: Bytes) -> Result<()> {
        let location = object_store::path::Path::from(path);
        let opts = object_store::PutOptions::from(object_store::PutMode::Create);
        self.with_retry("put_if_absent", || {
            self.block_on(async {
                self.inner
                    .put_opts(
                        &location,
                        object_store::PutPayload::from(data.clone()),
                        opts.clone(),
                    )
                    .await
                    .map(|_| ())
            })
        })
    }

    fn get(&self, path: &str) -> Result<Bytes> {
        let location = object_store::path::Path::from(path);
        self.with_retry("get", || {
            self.block_on(async { self.inner.get(&location).await?.bytes().await })
        })
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let location = object_store::path::Path::from(path);
        let range = (range.start as usize)..(range.end as usize);
        self.with_retry("get_range", || {
            self.block_on(async { self.inner.get_range(&location, range.clone()).await })
        })
    }

    fn len(&self, path: &str) -> Result<u64> {
        let location = object_store::path::Path::from(path);
        self.with_retry("len", || {
            self.block_on(async { self.inner.head(&location).await.map(|meta| meta.size as u64) })
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        use futures_util::StreamExt;

        let prefix = object_store::path::Path::from(prefix);
        self.with_retry("list", || {
            self.block_on(async {
                let mut stream = self.inner.list(Some(&prefix));
                let mut keys = Vec::new();
                while let Some(next) = stream.next().await {
                    keys.push(next?.location.to_string());
                }
                keys.sort();
                Ok(keys)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_put_get_list() -> Result<()> {
        let store = InMemoryObjectStore::new();

        store.put("db/wal/1.sst", Bytes::from_static(b"hello"))?;
        store.put("db/wal/2.sst", Bytes::from_static(b"world"))?;

        assert_eq!(store.get("db/wal/1.sst")?, Bytes::from_static(b"hello"));
        assert_eq!(store.len("db/wal/2.sst")?, 5);
        assert_eq!(
            store.get_range("db/wal/1.sst", 1..3)?,
            Bytes::from_static(b"el")
        );

        let listed = store.list("db/wal/")?;
        assert_eq!(listed, vec!["db/wal/1.sst", "db/wal/2.sst"]);

        assert!(matches!(
            store.get("db/wal/9.sst"),
            Err(Error::ObjectNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn read_only_object_views_one_object() -> Result<()> {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("db/compacted/x.sst", Bytes::from_static(b"0123456789"))?;

        let obj = ReadOnlyObject::new(store, "db/compacted/x.sst");
        assert_eq!(obj.len()?, 10);
        assert_eq!(obj.read()?, Bytes::from_static(b"0123456789"));
        assert_eq!(obj.read_range(4..7)?, Bytes::from_static(b"456"));
        Ok(())
    }

    #[test]
    fn in_memory_conditional_put_conflicts() -> Result<()> {
        let store = InMemoryObjectStore::new();
        store.put_if_absent("db/manifest/1.manifest", Bytes::from_static(b"a"))?;
        assert!(matches!(
            store.put_if_absent("db/manifest/1.manifest", Bytes::from_static(b"b")),
            Err(Error::AlreadyExists)
        ));
        // losing writer must not clobber
        assert_eq!(
            store.get("db/manifest/1.manifest")?,
            Bytes::from_static(b"a")
        );
        Ok(())
    }

    #[test]
    fn local_store_put_get_list_and_cas() -> Result<()> {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = LocalObjectStore::new(dir.path())?;

        store.put("db/wal/1.sst", Bytes::from_static(b"hello"))?;
        assert_eq!(store.get("db/wal/1.sst")?, Bytes::from_static(b"hello"));
        assert_eq!(
            store.get_range("db/wal/1.sst", 0..2)?,
            Bytes::from_static(b"he")
        );

        store.put_if_absent("db/manifest/1.manifest", Bytes::from_static(b"m"))?;
        assert!(matches!(
            store.put_if_absent("db/manifest/1.manifest", Bytes::from_static(b"n")),
            Err(Error::AlreadyExists)
        ));

        let listed = store.list("db/")?;
        assert_eq!(listed, vec!["db/manifest/1.manifest", "db/wal/1.sst"]);
        Ok(())
    }
}

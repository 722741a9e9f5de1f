use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;

/// Minimal key/value contract the event stream persists through. Keys are
/// slash-separated, relative, and never contain `..`.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Resolve a store implementation from its config tag.
pub fn store_for(tag: &str, root: impl AsRef<Path>) -> anyhow::Result<Arc<dyn FileStore>> {
    match tag {
        "local" => Ok(Arc::new(LocalFileStore::new(root))),
        "memory" => Ok(Arc::new(MemoryFileStore::new())),
        other => anyhow::bail!("unknown file_store tag `{other}`"),
    }
}

fn validate_key(key: &str) -> anyhow::Result<()> {
    if key.is_empty() {
        anyhow::bail!("empty store key");
    }
    let path = Path::new(key);
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!("store key `{key}` escapes the store root");
    }
    Ok(())
}

pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        validate_key(key)?;
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create dir for `{key}`"))?;
        }
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("write `{key}`"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        validate_key(key)?;
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read `{key}`")),
        }
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let base = if prefix.is_empty() {
            self.root.clone()
        } else {
            validate_key(prefix)?;
            self.path_for(prefix)
        };
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err).with_context(|| format!("list under {dir:?}")),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    keys.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        validate_key(key)?;
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("delete `{key}`")),
        }
    }
}

/// In-memory backend for tests and ephemeral sessions.
pub struct MemoryFileStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        validate_key(key)?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        validate_key(key)?;
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_roundtrips_and_lists_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalFileStore::new(dir.path());

        store.put("s1/events/000001.json", b"b").await.expect("put");
        store.put("s1/events/000000.json", b"a").await.expect("put");
        store.put("s1/state.json", b"{}").await.expect("put");

        assert_eq!(
            store.get("s1/events/000000.json").await.expect("get"),
            Some(b"a".to_vec())
        );
        assert_eq!(store.get("s1/missing.json").await.expect("get"), None);

        let keys = store.list("s1/events").await.expect("list");
        assert_eq!(
            keys,
            vec![
                "s1/events/000000.json".to_string(),
                "s1/events/000001.json".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let store = MemoryFileStore::new();
        assert!(store.put("../outside", b"x").await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryFileStore::new();
        store.put("a/b", b"x").await.expect("put");
        store.delete("a/b").await.expect("delete");
        store.delete("a/b").await.expect("second delete");
        assert_eq!(store.get("a/b").await.expect("get"), None);
    }
}

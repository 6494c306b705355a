//! Hot object storage.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use annoflow_core::ObjectLocation;

use super::ProviderError;

pub trait ObjectStore: Send + Sync {
    fn exists(&self, location: &ObjectLocation) -> Result<bool, ProviderError>;

    /// `NotFound` if the object does not exist.
    fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, ProviderError>;

    fn put(&self, location: &ObjectLocation, bytes: &[u8]) -> Result<(), ProviderError>;

    /// Deleting a missing object succeeds.
    fn delete(&self, location: &ObjectLocation) -> Result<(), ProviderError>;

    fn presigned_url(&self, location: &ObjectLocation, ttl: Duration) -> Result<String, ProviderError>;
}

impl<O> ObjectStore for Arc<O>
where
    O: ObjectStore + ?Sized,
{
    fn exists(&self, location: &ObjectLocation) -> Result<bool, ProviderError> {
        (**self).exists(location)
    }

    fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, ProviderError> {
        (**self).get(location)
    }

    fn put(&self, location: &ObjectLocation, bytes: &[u8]) -> Result<(), ProviderError> {
        (**self).put(location, bytes)
    }

    fn delete(&self, location: &ObjectLocation) -> Result<(), ProviderError> {
        (**self).delete(location)
    }

    fn presigned_url(&self, location: &ObjectLocation, ttl: Duration) -> Result<String, ProviderError> {
        (**self).presigned_url(location, ttl)
    }
}

fn expiry(ttl: Duration) -> i64 {
    chrono::Utc::now().timestamp() + ttl.as_secs() as i64
}

#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<ObjectLocation, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> ProviderError {
        ProviderError::Transient("object store lock poisoned".into())
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn exists(&self, location: &ObjectLocation) -> Result<bool, ProviderError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects.contains_key(location))
    }

    fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, ProviderError> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(location)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("object {location}")))
    }

    fn put(&self, location: &ObjectLocation, bytes: &[u8]) -> Result<(), ProviderError> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert(location.clone(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, location: &ObjectLocation) -> Result<(), ProviderError> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.remove(location);
        Ok(())
    }

    fn presigned_url(&self, location: &ObjectLocation, ttl: Duration) -> Result<String, ProviderError> {
        Ok(format!(
            "memory://{}/{}?expires={}",
            location.bucket,
            location.key,
            expiry(ttl)
        ))
    }
}

/// Buckets are directories under `root`; keys are relative paths inside them.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, location: &ObjectLocation) -> Result<PathBuf, ProviderError> {
        let safe = |p: &str| {
            Path::new(p)
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        };
        if !safe(&location.bucket) || !safe(&location.key) {
            return Err(ProviderError::Rejected(format!(
                "object location escapes storage root: {location}"
            )));
        }
        Ok(self.root.join(&location.bucket).join(&location.key))
    }
}

fn io_error(location: &ObjectLocation, err: std::io::Error) -> ProviderError {
    match err.kind() {
        ErrorKind::NotFound => ProviderError::NotFound(format!("object {location}")),
        ErrorKind::PermissionDenied => ProviderError::Rejected(format!("{location}: {err}")),
        _ => ProviderError::Transient(format!("{location}: {err}")),
    }
}

impl ObjectStore for FsObjectStore {
    fn exists(&self, location: &ObjectLocation) -> Result<bool, ProviderError> {
        Ok(self.path_for(location)?.is_file())
    }

    fn get(&self, location: &ObjectLocation) -> Result<Vec<u8>, ProviderError> {
        std::fs::read(self.path_for(location)?).map_err(|e| io_error(location, e))
    }

    fn put(&self, location: &ObjectLocation, bytes: &[u8]) -> Result<(), ProviderError> {
        let path = self.path_for(location)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(location, e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| io_error(location, e))
    }

    fn delete(&self, location: &ObjectLocation) -> Result<(), ProviderError> {
        match std::fs::remove_file(self.path_for(location)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(location, e)),
        }
    }

    fn presigned_url(&self, location: &ObjectLocation, ttl: Duration) -> Result<String, ProviderError> {
        let path = self.path_for(location)?;
        Ok(format!("file://{}?expires={}", path.display(), expiry(ttl)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(key: &str) -> ObjectLocation {
        ObjectLocation::new("results", key).unwrap()
    }

    #[test]
    fn fs_store_round_trip_and_idempotent_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let l = loc("prefix/U1/J1~a.annot.vcf");

        assert!(!store.exists(&l).unwrap());
        store.put(&l, b"data").unwrap();
        assert!(store.exists(&l).unwrap());
        assert_eq!(store.get(&l).unwrap(), b"data");

        store.delete(&l).unwrap();
        store.delete(&l).unwrap();
        assert!(matches!(store.get(&l), Err(ProviderError::NotFound(_))));
    }

    #[test]
    fn fs_store_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(matches!(
            store.put(&loc("../outside"), b"x"),
            Err(ProviderError::Rejected(_))
        ));
    }

    #[test]
    fn presigned_url_carries_expiry() {
        let store = InMemoryObjectStore::new();
        let url = store.presigned_url(&loc("k"), Duration::from_secs(60)).unwrap();
        assert!(url.starts_with("memory://results/k?expires="));
    }
}

use crate::core::{Result, SessionError};
use im::OrdMap;
use serde::{Deserialize, Serialize};

/// A namespaced compartment of the bucket store: byte keys mapped to byte
/// values, plus named child buckets.
///
/// Both maps are persistent (`im::OrdMap`), so cloning a bucket tree is
/// O(1) and writers copy only the paths they touch. Read transactions rely
/// on that to work on a stable snapshot while a writer builds the next one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bucket {
    entries: OrdMap<Vec<u8>, Vec<u8>>,
    buckets: OrdMap<Vec<u8>, Bucket>,
}

impl Bucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Number of key/value pairs, child buckets excluded.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn bucket(&self, name: &[u8]) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    pub fn bucket_names(&self) -> impl Iterator<Item = &[u8]> {
        self.buckets.keys().map(Vec::as_slice)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Follows a path of nested bucket names starting at this bucket.
    pub fn resolve(&self, path: &[Vec<u8>]) -> Option<&Bucket> {
        let mut current = self;
        for name in path {
            current = current.buckets.get(name.as_slice())?;
        }
        Some(current)
    }

    pub(crate) fn resolve_mut(&mut self, path: &[Vec<u8>]) -> Option<&mut Bucket> {
        let mut current = self;
        for name in path {
            current = current.buckets.get_mut(name.as_slice())?;
        }
        Some(current)
    }

    pub(crate) fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    pub(crate) fn remove(&mut self, key: &[u8]) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn create_bucket(&mut self, name: Vec<u8>) -> Result<()> {
        if self.buckets.contains_key(name.as_slice()) {
            return Err(SessionError::Bucket(format!(
                "bucket '{}' already exists",
                String::from_utf8_lossy(&name)
            )));
        }
        self.buckets.insert(name, Bucket::new());
        Ok(())
    }

    pub(crate) fn delete_bucket(&mut self, name: &[u8]) -> Result<()> {
        match self.buckets.remove(name) {
            Some(_) => Ok(()),
            None => Err(SessionError::Bucket(format!(
                "bucket '{}' not found",
                String::from_utf8_lossy(name)
            ))),
        }
    }
}

/// Human readable rendering of a bucket path, for logs and errors.
pub(crate) fn display_path(path: &[Vec<u8>]) -> String {
    path.iter()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_resolution() {
        let mut root = Bucket::new();
        root.create_bucket(b"sessions".to_vec()).unwrap();
        root.resolve_mut(&[b"sessions".to_vec()])
            .unwrap()
            .create_bucket(b"abc".to_vec())
            .unwrap();

        let path = vec![b"sessions".to_vec(), b"abc".to_vec()];
        root.resolve_mut(&path)
            .unwrap()
            .put(b"name".to_vec(), b"iris".to_vec());

        assert_eq!(root.resolve(&path).unwrap().get(b"name"), Some(&b"iris"[..]));
        assert!(root.resolve(&[b"missing".to_vec()]).is_none());
        assert_eq!(display_path(&path), "sessions/abc");
    }

    #[test]
    fn test_clone_is_isolated() {
        let mut original = Bucket::new();
        original.put(b"k".to_vec(), b"v1".to_vec());

        let mut copy = original.clone();
        copy.put(b"k".to_vec(), b"v2".to_vec());

        assert_eq!(original.get(b"k"), Some(&b"v1"[..]));
        assert_eq!(copy.get(b"k"), Some(&b"v2"[..]));
    }

    #[test]
    fn test_bucket_lifecycle_errors() {
        let mut root = Bucket::new();
        root.create_bucket(b"a".to_vec()).unwrap();

        assert!(matches!(
            root.create_bucket(b"a".to_vec()),
            Err(SessionError::Bucket(_))
        ));
        root.delete_bucket(b"a").unwrap();
        assert!(matches!(root.delete_bucket(b"a"), Err(SessionError::Bucket(_))));
    }

    #[test]
    fn test_keys_and_buckets_are_counted_apart() {
        let mut bucket = Bucket::new();
        bucket.put(b"x".to_vec(), vec![1]);
        bucket.create_bucket(b"child".to_vec()).unwrap();

        assert_eq!(bucket.key_count(), 1);
        assert_eq!(bucket.bucket_count(), 1);
        assert_eq!(bucket.get(b"x"), Some(&[1u8][..]));
    }
}

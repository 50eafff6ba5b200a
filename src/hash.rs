// Copyright 2020 Joyent, Inc.

//! Compact numeric identifiers for request paths.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Error;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash of a path.
pub fn hash_path(path: &str) -> u32 {
    path.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

#[derive(Default)]
struct Bindings {
    by_hash: HashMap<u32, String>,
    by_path: HashMap<String, u32>,
}

/// Maps paths to hashes, refusing to let two paths share one hash.
pub struct PathHashRegistry {
    hasher: fn(&str) -> u32,
    bindings: Mutex<Bindings>,
}

impl Default for PathHashRegistry {
    fn default() -> Self {
        PathHashRegistry::new()
    }
}

impl PathHashRegistry {
    pub fn new() -> PathHashRegistry {
        PathHashRegistry::with_hasher(hash_path)
    }

    pub fn with_hasher(hasher: fn(&str) -> u32) -> PathHashRegistry {
        PathHashRegistry {
            hasher,
            bindings: Mutex::new(Bindings::default()),
        }
    }

    /// Registers `path` and returns its hash. Registering the same path again
    /// returns the same hash; a different path with the same hash fails with
    /// [`Error::HashCollision`] and leaves the existing binding untouched.
    pub fn register(&self, path: &str) -> Result<u32, Error> {
        let hash = (self.hasher)(path);
        let mut bindings = self.lock();

        match bindings.by_hash.get(&hash) {
            Some(existing) if existing == path => Ok(hash),
            Some(existing) => Err(Error::HashCollision {
                hash,
                path: path.to_string(),
                existing: existing.clone(),
            }),
            None => {
                bindings.by_hash.insert(hash, path.to_string());
                bindings.by_path.insert(path.to_string(), hash);
                Ok(hash)
            }
        }
    }

    pub fn resolve(&self, hash: u32) -> Option<String> {
        self.lock().by_hash.get(&hash).cloned()
    }

    pub fn lookup(&self, path: &str) -> Option<u32> {
        self.lock().by_path.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bindings> {
        // the maps are only mutated together under the lock, so a poisoned
        // guard still holds consistent bindings
        self.bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(hash_path(""), 0x811c_9dc5);
        assert_eq!(hash_path("a"), 0xe40c_292c);
        assert_eq!(hash_path("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn register_is_idempotent() {
        let registry = PathHashRegistry::new();
        let first = registry.register("/sensors/temp").unwrap();
        let second = registry.register("/sensors/temp").unwrap();

        assert_eq!(first, second);
        assert_eq!(first, hash_path("/sensors/temp"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(first).as_deref(), Some("/sensors/temp"));
        assert_eq!(registry.lookup("/sensors/temp"), Some(first));
    }

    #[test]
    fn collision_is_rejected() {
        let registry = PathHashRegistry::with_hasher(|_| 7);
        assert_eq!(registry.register("/a").unwrap(), 7);

        let err = registry.register("/b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HashCollision);
        match err {
            Error::HashCollision {
                hash,
                path,
                existing,
            } => {
                assert_eq!(hash, 7);
                assert_eq!(path, "/b");
                assert_eq!(existing, "/a");
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert_eq!(registry.resolve(7).as_deref(), Some("/a"));
        assert_eq!(registry.lookup("/b"), None);
        assert_eq!(registry.register("/a").unwrap(), 7);
    }

    #[test]
    fn unknown_hash_does_not_resolve() {
        let registry = PathHashRegistry::default();
        assert!(registry.is_empty());
        assert_eq!(registry.resolve(1), None);
    }

    #[test]
    fn concurrent_registration() {
        let registry = Arc::new(PathHashRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..100 {
                        let path = format!("/shared/{}", (i + t) % 50);
                        registry.register(&path).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 50);
    }
}

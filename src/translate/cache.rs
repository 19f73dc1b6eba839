//! Run-scoped fingerprint cache.
//! Key: blake3 hash of the fragment text. No eviction, no TTL: the cache lives
//! for one translation run and is cleared when the next run starts.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Content hash identifying a fragment.
pub type Fingerprint = [u8; 32];

/// Compute the fingerprint of a fragment.
pub fn fingerprint(text: &str) -> Fingerprint {
    *blake3::hash(text.as_bytes()).as_bytes()
}

/// Short hex prefix of a fingerprint, for log fields.
pub fn short_hex(key: &Fingerprint) -> String {
    key[..6].iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Default)]
pub struct FingerprintCache {
    inner: RwLock<HashMap<Fingerprint, String>>,
}

impl FingerprintCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a translated fragment.
    pub fn get(&self, key: &Fingerprint) -> Option<String> {
        self.inner.read().get(key).cloned()
    }

    pub fn contains(&self, key: &Fingerprint) -> bool {
        self.inner.read().contains_key(key)
    }

    /// Store a translation. Duplicate computations of the same fragment may
    /// race here; the last writer wins.
    pub fn put(&self, key: Fingerprint, translated: String) {
        self.inner.write().insert(key, translated);
    }

    /// Store only if no translation is present yet. Returns true when written.
    pub fn put_if_absent(&self, key: Fingerprint, translated: String) -> bool {
        let mut map = self.inner.write();
        if map.contains_key(&key) {
            return false;
        }
        map.insert(key, translated);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

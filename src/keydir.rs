//! The in-memory key index and the pending-write buffer.

use std::collections::{BTreeMap, HashMap};

/// Location and metadata of the most recent value written for a key.
/// `value_pos` is the offset of the value itself within the segment, past
/// the record header and key.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDirEntry {
    pub file_id: u64,
    pub value_len: u32,
    pub value_pos: u64,
    pub timestamp: u32,
}

/// Maps each live key to the location of its current value on disk. Keys
/// are kept in lexicographic order, which key listings rely on.
#[derive(Debug, Default, PartialEq)]
pub struct KeyDir(BTreeMap<Vec<u8>, KeyDirEntry>);

impl KeyDir {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn upsert(&mut self, key: Vec<u8>, entry: KeyDirEntry) {
        self.0.insert(key, entry);
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<KeyDirEntry> {
        self.0.remove(key)
    }

    pub fn lookup(&self, key: &[u8]) -> Option<&KeyDirEntry> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &KeyDirEntry)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Vec<u8>, &mut KeyDirEntry)> {
        self.0.iter_mut()
    }
}

/// Staging area for writes made while sync-on-put is disabled. Entries
/// shadow the keydir for reads until they are flushed to disk.
#[derive(Debug, Default)]
pub struct PendingWrites(HashMap<Vec<u8>, Vec<u8>>);

impl PendingWrites {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.0.get(key)
    }

    pub fn take(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.remove(key)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + '_ {
        self.0.drain()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file_id: u64) -> KeyDirEntry {
        KeyDirEntry { file_id, value_len: 5, value_pos: 19, timestamp: 42 }
    }

    #[test]
    fn upsert_replaces_and_lookup_finds() {
        let mut keydir = KeyDir::new();
        keydir.upsert(b"key".to_vec(), entry(1));
        keydir.upsert(b"key".to_vec(), entry(2));
        assert_eq!(keydir.lookup(b"key"), Some(&entry(2)));
        assert_eq!(keydir.len(), 1);
        assert_eq!(keydir.lookup(b"other"), None);
    }

    #[test]
    fn keys_are_sorted() {
        let mut keydir = KeyDir::new();
        for key in [&b"banana"[..], b"apple", b"cherry"] {
            keydir.upsert(key.to_vec(), entry(1));
        }
        let keys: Vec<_> = keydir.keys().cloned().collect();
        assert_eq!(keys, vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()]);
    }

    #[test]
    fn remove_returns_the_entry() {
        let mut keydir = KeyDir::new();
        keydir.upsert(b"key".to_vec(), entry(1));
        assert_eq!(keydir.remove(b"key"), Some(entry(1)));
        assert_eq!(keydir.remove(b"key"), None);
    }

    #[test]
    fn pending_put_get_take() {
        let mut pending = PendingWrites::new();
        pending.put(b"key".to_vec(), b"old".to_vec());
        pending.put(b"key".to_vec(), b"new".to_vec());
        assert_eq!(pending.get(b"key"), Some(&b"new".to_vec()));
        assert_eq!(pending.take(b"key"), Some(b"new".to_vec()));
        assert_eq!(pending.take(b"key"), None);
        assert!(pending.is_empty());
    }

    #[test]
    fn pending_drain_empties_the_buffer() {
        let mut pending = PendingWrites::new();
        pending.put(b"a".to_vec(), b"1".to_vec());
        pending.put(b"b".to_vec(), b"2".to_vec());
        let mut drained: Vec<_> = pending.drain().collect();
        drained.sort();
        assert_eq!(
            drained,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
        );
        assert!(pending.is_empty());
    }
}

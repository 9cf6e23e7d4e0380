//! Module constant pool.
//!
//! String literals live here and are referenced from `str` instructions by
//! [`ConstId`]. The string encryptor replaces plaintext entries in place with
//! ciphertext and records the key next to it.

use super::ConstId;
use hashbrown::HashMap;

/// Who produced a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstOrigin {
    /// Present in the input program.
    Source,
    /// Created by an obfuscation pass (decoys in dead code).
    Generated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringConstant {
    pub name: String,
    pub bytes: Vec<u8>,
    pub origin: ConstOrigin,
    /// Key the bytes are encrypted with, if any.
    pub key: Option<u64>,
}

impl StringConstant {
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstantPool {
    entries: Vec<StringConstant>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: ConstId) -> Option<&StringConstant> {
        self.entries.get(id.index())
    }

    pub fn get_mut(&mut self, id: ConstId) -> Option<&mut StringConstant> {
        self.entries.get_mut(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstId, &StringConstant)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, c)| (ConstId(i as u32), c))
    }

    pub fn find(&self, name: &str) -> Option<ConstId> {
        self.entries
            .iter()
            .position(|c| c.name == name)
            .map(|i| ConstId(i as u32))
    }

    /// Append an entry. Names must be unique; a clash gets a numeric suffix.
    pub fn push(&mut self, name: &str, bytes: Vec<u8>, origin: ConstOrigin) -> ConstId {
        let mut unique = name.to_string();
        let mut n = 0;
        while self.find(&unique).is_some() {
            n += 1;
            unique = format!("{name}.{n}");
        }
        let id = ConstId(self.entries.len() as u32);
        self.entries.push(StringConstant { name: unique, bytes, origin, key: None });
        id
    }

    /// Return the existing unencrypted entry with these bytes and origin, or add one.
    pub fn intern(&mut self, name: &str, bytes: &[u8], origin: ConstOrigin) -> ConstId {
        if let Some((id, _)) = self
            .iter()
            .find(|(_, c)| c.bytes == bytes && c.origin == origin && c.key.is_none())
        {
            return id;
        }
        self.push(name, bytes.to_vec(), origin)
    }

    /// Merge entries with identical plaintext and origin.
    ///
    /// Returns the old-to-new id mapping; callers must rewrite every `str`
    /// reference with it. Encrypted entries are never merged.
    pub fn dedup(&mut self) -> Vec<ConstId> {
        let mut remap = Vec::with_capacity(self.entries.len());
        let mut kept: Vec<StringConstant> = Vec::new();
        let mut seen: HashMap<(Vec<u8>, bool), u32> = HashMap::new();
        for entry in self.entries.drain(..) {
            let generated = entry.origin == ConstOrigin::Generated;
            if entry.key.is_none() {
                if let Some(&idx) = seen.get(&(entry.bytes.clone(), generated)) {
                    remap.push(ConstId(idx));
                    continue;
                }
                seen.insert((entry.bytes.clone(), generated), kept.len() as u32);
            }
            remap.push(ConstId(kept.len() as u32));
            kept.push(entry);
        }
        self.entries = kept;
        remap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_reuses_entries() {
        let mut pool = ConstantPool::new();
        let a = pool.intern(".str", b"hello", ConstOrigin::Source);
        let b = pool.intern(".str", b"hello", ConstOrigin::Source);
        let c = pool.intern(".str", b"world", ConstOrigin::Source);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.get(c).unwrap().name, ".str.1");
    }

    #[test]
    fn test_dedup_merges_identical_plaintext() {
        let mut pool = ConstantPool::new();
        pool.push("a", b"same".to_vec(), ConstOrigin::Source);
        pool.push("b", b"other".to_vec(), ConstOrigin::Source);
        pool.push("c", b"same".to_vec(), ConstOrigin::Source);
        pool.push("d", b"same".to_vec(), ConstOrigin::Generated);
        let remap = pool.dedup();
        assert_eq!(remap, vec![ConstId(0), ConstId(1), ConstId(0), ConstId(2)]);
        assert_eq!(pool.len(), 3);
    }
}

//! Session items: an ordered key/value collection with change tracking.
//!
//! A client loads the items with the locked record, edits them, and sends back
//! only what changed. The store merges those changes into its copy with
//! [`SessionItems::apply_changes`].
//!
//! Wire form (object type id 2), after a leading `full` flag:
//! - full: `i32` count, then `(string key, byte-array value)` pairs
//! - diff: `i32` count + dirty pairs, then `i32` count + removed keys

use crate::codec::{BinaryObject, BinaryReader, BinaryWriter};
use latch_core::error::{LatchError, Result};
use std::collections::HashMap;

/// Where a collection's contents came from; decides how it is written and
/// how it merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Built locally or produced by a merge; written whole, merged entry by entry
    Local,
    /// Decoded from a whole write; replaces on merge, written as a diff once edited
    Snapshot,
    /// Decoded from a diff; re-encodes as the same diff
    Delta,
}

#[derive(Debug, Clone)]
struct ItemEntry {
    key: String,
    value: Vec<u8>,
    dirty: bool,
    /// Present when the collection was loaded
    initial: bool,
}

/// Key/value session attributes with dirty tracking.
///
/// Values are opaque serialized objects. Equality compares keys and values in
/// order and ignores tracking state.
#[derive(Debug, Clone)]
pub struct SessionItems {
    entries: Vec<ItemEntry>,
    index: HashMap<String, usize>,
    removed: Vec<String>,
    dirty_all: bool,
    origin: Origin,
}

impl Default for SessionItems {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for SessionItems {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for SessionItems {}

impl SessionItems {
    /// Create an empty collection
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            removed: Vec::new(),
            dirty_all: false,
            origin: Origin::Local,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    /// Key/value pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|e| (e.key.as_str(), e.value.as_slice()))
    }

    /// Read a value without marking it dirty
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.index
            .get(key)
            .map(|&i| self.entries[i].value.as_slice())
    }

    /// Mutable access; the entry is marked dirty since it may change in place
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Vec<u8>> {
        let i = *self.index.get(key)?;
        let entry = &mut self.entries[i];
        entry.dirty = true;
        Some(&mut entry.value)
    }

    /// Insert or overwrite a value.
    ///
    /// Re-adding a removed key cancels the removal; the entry still counts as
    /// loaded, so removing it again is recorded.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();

        if let Some(&i) = self.index.get(&key) {
            let entry = &mut self.entries[i];
            entry.value = value;
            entry.dirty = true;
            return;
        }

        let initial = match self.removed.iter().position(|k| k == &key) {
            Some(pos) => {
                self.removed.remove(pos);
                true
            }
            None => false,
        };

        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(ItemEntry {
            key,
            value,
            dirty: true,
            initial,
        });
    }

    /// Remove a value, remembering the key if it came from the store
    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        let i = self.index.remove(key)?;
        let entry = self.entries.remove(i);
        self.reindex();

        if entry.initial {
            self.removed.push(entry.key);
        }
        Some(entry.value)
    }

    /// Remove everything; the next write replaces the stored collection
    pub fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            if entry.initial {
                self.removed.push(entry.key);
            }
        }
        self.index.clear();
        self.dirty_all = true;
    }

    /// Whether anything changed since the collection was loaded
    pub fn is_dirty(&self) -> bool {
        self.dirty_all || !self.removed.is_empty() || self.entries.iter().any(|e| e.dirty)
    }

    /// Keys removed since the collection was loaded
    pub fn removed_keys(&self) -> &[String] {
        &self.removed
    }

    /// Whether the next write sends the whole collection rather than a diff
    pub fn writes_full(&self) -> bool {
        match self.origin {
            Origin::Local => true,
            Origin::Delta => false,
            Origin::Snapshot => {
                self.dirty_all || self.entries.is_empty() || self.entries.iter().all(|e| e.dirty)
            }
        }
    }

    /// Whether merging this collection replaces the target's contents
    ///
    /// True for a cleared collection and for one decoded from a whole write.
    pub fn replaces(&self) -> bool {
        self.dirty_all || self.origin == Origin::Snapshot
    }

    /// Merge `delta` into this collection.
    ///
    /// A cleared delta, or one decoded from a whole write, replaces the
    /// contents. Otherwise its dirty entries are upserted and its removed keys
    /// deleted. The result is clean and is written whole from then on.
    pub fn apply_changes(&mut self, delta: &SessionItems) {
        if delta.replaces() {
            self.entries = delta.entries.clone();
        } else {
            for changed in delta.entries.iter().filter(|e| e.dirty) {
                match self.index.get(&changed.key) {
                    Some(&i) => self.entries[i].value = changed.value.clone(),
                    None => {
                        self.index.insert(changed.key.clone(), self.entries.len());
                        self.entries.push(changed.clone());
                    }
                }
            }

            if !delta.removed.is_empty() {
                self.entries.retain(|e| !delta.removed.contains(&e.key));
            }
        }

        for entry in &mut self.entries {
            entry.dirty = false;
            entry.initial = true;
        }
        self.removed.clear();
        self.dirty_all = false;
        self.origin = Origin::Local;
        self.reindex();
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.key.clone(), i))
            .collect();
    }

    fn read_entries(
        reader: &mut BinaryReader<'_>,
        loaded: bool,
        into: &mut SessionItems,
    ) -> Result<()> {
        let count = read_count(reader, "item")?;

        for _ in 0..count {
            let key = reader
                .read_string()?
                .ok_or_else(|| LatchError::decode("null item key"))?;
            let value = reader
                .read_byte_array()?
                .ok_or_else(|| LatchError::decode(format!("null value for item '{}'", key)))?;

            if into.index.contains_key(&key) {
                return Err(LatchError::decode(format!("duplicate item key '{}'", key)));
            }

            into.index.insert(key.clone(), into.entries.len());
            into.entries.push(ItemEntry {
                key,
                value,
                dirty: !loaded,
                initial: loaded,
            });
        }

        Ok(())
    }
}

fn read_count(reader: &mut BinaryReader<'_>, what: &str) -> Result<usize> {
    let count = reader.read_i32()?;
    usize::try_from(count).map_err(|_| LatchError::decode(format!("negative {} count {}", what, count)))
}

impl BinaryObject for SessionItems {
    const TYPE_ID: i32 = 2;

    fn write_binary(&self, writer: &mut BinaryWriter<'_>) {
        let full = self.writes_full();
        writer.write_bool(full);

        if full {
            writer.write_i32(self.entries.len() as i32);
            for entry in &self.entries {
                writer.write_string(Some(&entry.key));
                writer.write_byte_array(Some(&entry.value));
            }
            return;
        }

        let dirty: Vec<&ItemEntry> = self.entries.iter().filter(|e| e.dirty).collect();
        writer.write_i32(dirty.len() as i32);
        for entry in dirty {
            writer.write_string(Some(&entry.key));
            writer.write_byte_array(Some(&entry.value));
        }

        writer.write_i32(self.removed.len() as i32);
        for key in &self.removed {
            writer.write_string(Some(key));
        }
    }

    fn read_binary(reader: &mut BinaryReader<'_>) -> Result<Self> {
        let full = reader.read_bool()?;
        let mut items = SessionItems::new();

        if full {
            items.origin = Origin::Snapshot;
            Self::read_entries(reader, true, &mut items)?;
            return Ok(items);
        }

        items.origin = Origin::Delta;
        Self::read_entries(reader, false, &mut items)?;

        let removed = read_count(reader, "removed key")?;
        for _ in 0..removed {
            let key = reader
                .read_string()?
                .ok_or_else(|| LatchError::decode("null removed key"))?;
            items.removed.push(key);
        }

        Ok(items)
    }
}

//! Placement Group Index
//!
//! Per-container hash index from a key's name segment to its placement
//! group. Groups live in a bounded arena sized from configuration; bucket
//! chains link arena indices. Lookups compare names by length and bytes,
//! never by hash alone.

use crate::error::{JournalError, JournalResult};
use crate::key::{hash_name, DecodedKey};
use fnv::FnvHashSet;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Arena index of a placement group
pub type PgId = usize;

/// One placement group
#[derive(Debug)]
pub struct PlacementGroup {
    name: Box<[u8]>,
    hash: u64,
    stream: Option<usize>,
    /// `trim + 1`; 0 means unknown
    trim: AtomicU64,
    newest: Option<u64>,
    aging: bool,
    next: Option<PgId>,
}

impl PlacementGroup {
    fn new(name: &[u8], hash: u64, stream: Option<usize>) -> Self {
        PlacementGroup {
            name: name.into(),
            hash,
            stream,
            trim: AtomicU64::new(0),
            newest: None,
            aging: false,
            next: None,
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Owning stream index, if assigned
    pub fn stream(&self) -> Option<usize> {
        self.stream
    }

    pub fn assign_stream(&mut self, stream: usize) {
        self.stream = Some(stream);
    }

    /// Highest counter considered deleted
    pub fn trim_position(&self) -> Option<u64> {
        match self.trim.load(Ordering::Acquire) {
            0 => None,
            encoded => Some(encoded - 1),
        }
    }

    /// Move the trim position forward to `counter`; never moves it back
    pub fn advance_trim(&self, counter: u64) {
        let encoded = counter.saturating_add(1);
        self.trim.fetch_max(encoded, Ordering::AcqRel);
    }

    /// Whether a record with this counter is trimmed away
    pub fn is_trimmed(&self, counter: u64) -> bool {
        self.trim_position().is_some_and(|t| counter <= t)
    }

    /// Newest counter seen in the stream's oldest SO
    pub fn newest(&self) -> Option<u64> {
        self.newest
    }

    pub fn is_aging(&self) -> bool {
        self.aging
    }

    /// Link into the aging set; returns false if already linked
    pub fn link_aging(&mut self) -> bool {
        if self.aging {
            return false;
        }
        self.aging = true;
        true
    }

    pub fn observe_counter(&mut self, counter: u64) {
        self.newest = Some(self.newest.map_or(counter, |n| n.max(counter)));
    }

    /// Drop aging membership and the newest counter
    pub fn clear_aging(&mut self) {
        self.aging = false;
        self.newest = None;
    }

    /// Everything this group wrote into the aging SO is at or below its trim
    pub fn is_obsolete(&self) -> bool {
        match (self.newest, self.trim_position()) {
            (None, _) => true,
            (Some(newest), Some(trim)) => newest <= trim,
            (Some(_), None) => false,
        }
    }
}

/// Comparable view of one placement group
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PgSnapshot {
    pub name: String,
    pub stream: Option<usize>,
    pub trim: Option<u64>,
    pub newest: Option<u64>,
    pub aging: bool,
}

/// Bounded hash index of placement groups
#[derive(Debug)]
pub struct PlacementIndex {
    groups: Vec<PlacementGroup>,
    buckets: Vec<Option<PgId>>,
    capacity: usize,
    max_key_len: usize,
}

impl PlacementIndex {
    pub fn new(buckets: usize, capacity: usize, max_key_len: usize) -> Self {
        debug_assert!(buckets > 0, "Precondition: at least one bucket");
        PlacementIndex {
            groups: Vec::with_capacity(capacity),
            buckets: vec![None; buckets],
            capacity,
            max_key_len,
        }
    }

    /// Decode a raw key against this index's length budget
    pub fn decode<'a>(&self, raw: &'a str) -> JournalResult<DecodedKey<'a>> {
        DecodedKey::parse(raw, self.max_key_len)
    }

    /// Decode `raw` and find its group without allocating
    pub fn lookup(&self, raw: &str) -> JournalResult<Option<PgId>> {
        let key = self.decode(raw)?;
        Ok(self.lookup_readonly(&key))
    }

    /// Find the group for an already decoded key
    pub fn lookup_readonly(&self, key: &DecodedKey<'_>) -> Option<PgId> {
        self.find(key.name(), key.name_hash())
    }

    /// Find a group by name bytes
    pub fn find_by_name(&self, name: &[u8]) -> Option<PgId> {
        self.find(name, hash_name(name))
    }

    /// Find or allocate the group for `key`. `assign` supplies the stream for
    /// a new group and is only called when one is created.
    pub fn lookup_or_create(
        &mut self,
        key: &DecodedKey<'_>,
        assign: impl FnOnce() -> Option<usize>,
    ) -> JournalResult<PgId> {
        let hash = key.name_hash();
        if let Some(id) = self.find(key.name(), hash) {
            return Ok(id);
        }
        if self.groups.len() >= self.capacity {
            return Err(JournalError::OutOfMemory("placement group"));
        }

        let id = self.groups.len();
        let bucket = self.bucket_of(hash);
        let mut group = PlacementGroup::new(key.name(), hash, assign());
        group.next = self.buckets[bucket];
        self.groups.push(group);
        self.buckets[bucket] = Some(id);

        debug_assert!(self.groups.len() <= self.capacity, "Postcondition: arena bounded");
        Ok(id)
    }

    /// Fail with `OutOfMemory` unless a group can be created for every
    /// distinct unknown name among `keys`. Allocates nothing.
    pub fn ensure_room(&self, keys: &[DecodedKey<'_>]) -> JournalResult<()> {
        let mut missing: FnvHashSet<&[u8]> = FnvHashSet::default();
        for key in keys {
            if self.lookup_readonly(key).is_none() {
                missing.insert(key.name());
            }
        }
        if self.groups.len() + missing.len() > self.capacity {
            return Err(JournalError::OutOfMemory("placement group"));
        }
        Ok(())
    }

    pub fn get(&self, id: PgId) -> &PlacementGroup {
        &self.groups[id]
    }

    pub fn get_mut(&mut self, id: PgId) -> &mut PlacementGroup {
        &mut self.groups[id]
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn ids(&self) -> std::ops::Range<PgId> {
        0..self.groups.len()
    }

    pub fn snapshot(&self) -> Vec<PgSnapshot> {
        let mut out: Vec<PgSnapshot> = self
            .groups
            .iter()
            .map(|g| PgSnapshot {
                name: String::from_utf8_lossy(&g.name).into_owned(),
                stream: g.stream,
                trim: g.trim_position(),
                newest: g.newest,
                aging: g.aging,
            })
            .collect();
        out.sort();
        out
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    fn find(&self, name: &[u8], hash: u64) -> Option<PgId> {
        let mut cursor = self.buckets[self.bucket_of(hash)];
        while let Some(id) = cursor {
            let group = &self.groups[id];
            if group.hash == hash && group.name.len() == name.len() && &*group.name == name {
                return Some(id);
            }
            cursor = group.next;
        }
        None
    }
}

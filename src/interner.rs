use std::sync::{
  Arc,
  atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nohash_hasher::BuildNoHashHasher;

/// Dense identifier for an interned call-context location.
///
/// Id 0 is reserved for the "unknown location" and is what lookups of
/// never-registered strings return.
pub type LocationId = u32;

/// The reserved id for allocations whose location could not be determined.
pub const UNKNOWN_LOCATION: LocationId = 0;

/// Append-only bidirectional mapping between location strings and dense ids.
///
/// Ids are never reused or reassigned; once `register` returns an id,
/// `resolve` succeeds for it for the rest of the process lifetime. Both
/// directions are sharded concurrent maps, so lookups racing an in-flight
/// registration observe either the old state or the fully published entry,
/// never a partial one.
#[derive(Debug)]
pub struct Interner {
  by_id: DashMap<LocationId, Arc<str>, BuildNoHashHasher<LocationId>>,
  by_name: DashMap<Arc<str>, LocationId>,
  next_id: AtomicU32,
}

impl Interner {
  /// Look up the id for a string without registering it.
  ///
  /// Returns [`UNKNOWN_LOCATION`] when the string has never been registered.
  #[must_use]
  pub fn lookup(&self, name: &str) -> LocationId {
    self
      .by_name
      .get(name)
      .map_or(UNKNOWN_LOCATION, |entry| *entry.value())
  }

  #[must_use]
  pub fn new(unknown_label: &str) -> Self {
    let interner = Self {
      by_id: DashMap::with_hasher(BuildNoHashHasher::default()),
      by_name: DashMap::new(),
      next_id: AtomicU32::new(1),
    };

    let label: Arc<str> = Arc::from(unknown_label);
    interner.by_id.insert(UNKNOWN_LOCATION, Arc::clone(&label));
    interner.by_name.insert(label, UNKNOWN_LOCATION);

    interner
  }

  /// Intern a location string, returning its stable id.
  ///
  /// Idempotent: re-registering a known string returns the existing id.
  pub fn register(&self, name: &str) -> LocationId {
    if let Some(existing) = self.by_name.get(name) {
      return *existing.value();
    }

    match self.by_name.entry(Arc::from(name)) {
      Entry::Occupied(entry) => *entry.get(),
      Entry::Vacant(entry) => {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug_assert!(id != u32::MAX, "interner id space exhausted");

        // Publish the reverse mapping before the forward one so any id
        // another thread can observe already resolves.
        self.by_id.insert(id, Arc::clone(entry.key()));
        entry.insert(id);

        id
      }
    }
  }

  /// Resolve an id back to its string, if the id was ever issued.
  #[must_use]
  pub fn resolve(&self, id: LocationId) -> Option<Arc<str>> {
    self.by_id.get(&id).map(|entry| Arc::clone(entry.value()))
  }

  /// Number of distinct locations registered, including the unknown entry.
  #[must_use]
  pub fn len(&self) -> usize {
    self.by_id.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.by_id.is_empty()
  }
}

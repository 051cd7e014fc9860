use std::sync::{
  Arc, Mutex,
  atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::histogram::HistogramSpec;
use crate::interner::LocationId;

/// Shared handle to the counter an instrumented allocation site increments.
pub type CounterHandle = Arc<CounterNode>;

/// Accumulated allocation activity for one path through
/// (type, location, nested call-context locations).
///
/// Counters are plain atomics incremented without locks from arbitrary
/// threads. Structural growth (new children, index rehash) takes a per-node
/// mutex scoped to this node only; nothing here serializes unrelated
/// allocation sites.
#[derive(Debug)]
pub struct CounterNode {
  buckets: Option<Box<[AtomicU64]>>,
  children: ArcSwap<ChildTable>,
  count: AtomicU64,
  grow: Mutex<()>,
  histogram: Option<Arc<HistogramSpec>>,
  location: LocationId,
  size: AtomicU64,
}

impl CounterNode {
  /// All live children, in unspecified order.
  #[must_use]
  pub fn children(&self) -> Vec<Arc<CounterNode>> {
    self.children.load().collect()
  }

  #[must_use]
  pub fn child(&self, location: LocationId) -> Option<Arc<CounterNode>> {
    self.children.load().get(location)
  }

  /// Find the child for `location`, creating it if this is the first time
  /// the location is seen under this node.
  ///
  /// The common path is a lock-free probe of the published index; only a
  /// miss takes the per-node growth lock, where the presence check is
  /// repeated because another thread may have just inserted the child.
  pub fn get_or_create_child(&self, location: LocationId) -> Arc<CounterNode> {
    if let Some(child) = self.children.load().get(location) {
      return child;
    }

    let _guard = lock_ignoring_poison(&self.grow);

    let table = self.children.load_full();
    if let Some(child) = table.get(location) {
      return child;
    }

    let child = Arc::new(CounterNode::new(location, self.histogram.clone()));

    if table.len() + 1 > table.capacity() / 2 {
      // Copy-and-swap: the replacement table is fully built before it is
      // published, so concurrent readers keep probing the old one.
      let grown = table.rehashed_with(location, Arc::clone(&child));
      self.children.store(Arc::new(grown));
    } else {
      table.insert(location, Arc::clone(&child));
    }

    child
  }

  #[must_use]
  pub fn has_children(&self) -> bool {
    self.children.load().len() > 0
  }

  /// Record one allocation.
  pub fn increment_count(&self) {
    self.count.fetch_add(1, Ordering::Relaxed);
  }

  /// Record one variable-size allocation, routing the length into the
  /// configured histogram bucket when this node carries one.
  pub fn increment_size_and_count(&self, length_or_size: u64) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.size.fetch_add(length_or_size, Ordering::Relaxed);

    if let (Some(buckets), Some(spec)) = (&self.buckets, &self.histogram) {
      let bucket = spec.bucket_for(length_or_size);
      buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }
  }

  /// Whether any counter in this subtree is at or above `limit`.
  ///
  /// Used by the overflow watchdog to force an out-of-band drain before a
  /// counter could wrap.
  #[must_use]
  pub fn is_overflow_threshold(&self, limit: u64) -> bool {
    if self.count.load(Ordering::Relaxed) >= limit
      || self.size.load(Ordering::Relaxed) >= limit
    {
      return true;
    }

    if let Some(buckets) = &self.buckets
      && buckets
        .iter()
        .any(|bucket| bucket.load(Ordering::Relaxed) >= limit)
    {
      return true;
    }

    self
      .children
      .load()
      .collect()
      .iter()
      .any(|child| child.is_overflow_threshold(limit))
  }

  #[must_use]
  pub fn histogram(&self) -> Option<&Arc<HistogramSpec>> {
    self.histogram.as_ref()
  }

  #[must_use]
  pub fn location(&self) -> LocationId {
    self.location
  }

  #[must_use]
  pub fn new(
    location: LocationId,
    histogram: Option<Arc<HistogramSpec>>,
  ) -> Self {
    let buckets = histogram.as_ref().map(|spec| {
      (0..spec.bucket_count())
        .map(|_| AtomicU64::new(0))
        .collect::<Vec<_>>()
        .into_boxed_slice()
    });

    Self {
      buckets,
      children: ArcSwap::from_pointee(ChildTable::new(INITIAL_CAPACITY)),
      count: AtomicU64::new(0),
      grow: Mutex::new(()),
      histogram,
      location,
      size: AtomicU64::new(0),
    }
  }

  /// Atomically read the histogram buckets while resetting them to zero.
  ///
  /// Returns `None` for nodes without a histogram. Only the snapshot taker
  /// calls this, and the registry serializes all snapshot taking.
  #[must_use]
  pub fn take_buckets(&self) -> Option<Vec<u64>> {
    self.buckets.as_ref().map(|buckets| {
      buckets
        .iter()
        .map(|bucket| bucket.swap(0, Ordering::AcqRel))
        .collect()
    })
  }

  /// Atomically read the allocation count while resetting it to zero.
  ///
  /// No increment racing this call is lost: it lands either in the returned
  /// value or in the next take.
  #[must_use]
  pub fn take_count(&self) -> u64 {
    self.count.swap(0, Ordering::AcqRel)
  }

  /// Atomically read the accumulated size while resetting it to zero.
  #[must_use]
  pub fn take_size(&self) -> u64 {
    self.size.swap(0, Ordering::AcqRel)
  }
}

const INITIAL_CAPACITY: usize = 4;

/// Sentinel for a vacant slot; location ids are interner-issued and never
/// reach this value.
const VACANT: u32 = u32::MAX;

/// Open-addressed child index in a power-of-two slot array.
///
/// Readers probe without locks against whichever table is currently
/// published. Writers (always under the owning node's growth lock) publish a
/// slot by storing the child first and the key last, so a reader that
/// observes the key always observes the child too. Growth never mutates a
/// table readers may be iterating; it builds a replacement and swaps it in
/// wholesale.
#[derive(Debug)]
struct ChildTable {
  len: AtomicUsize,
  mask: usize,
  slots: Box<[ChildSlot]>,
}

#[derive(Debug)]
struct ChildSlot {
  key: AtomicU32,
  node: ArcSwapOption<CounterNode>,
}

impl ChildTable {
  fn capacity(&self) -> usize {
    self.slots.len()
  }

  fn collect(&self) -> Vec<Arc<CounterNode>> {
    let mut children = Vec::with_capacity(self.len());

    for slot in &self.slots {
      if slot.key.load(Ordering::Acquire) != VACANT
        && let Some(node) = slot.node.load_full()
      {
        children.push(node);
      }
    }

    children
  }

  fn get(&self, location: LocationId) -> Option<Arc<CounterNode>> {
    let mut index = spread(location) & self.mask;

    loop {
      let slot = &self.slots[index];
      match slot.key.load(Ordering::Acquire) {
        VACANT => return None,
        key if key == location => return slot.node.load_full(),
        _ => index = (index + 1) & self.mask,
      }
    }
  }

  /// Publish a child into a vacant slot. Caller holds the growth lock and
  /// has verified both that the key is absent and that the load factor
  /// stays at or below one half.
  fn insert(&self, location: LocationId, node: Arc<CounterNode>) {
    let mut index = spread(location) & self.mask;

    loop {
      let slot = &self.slots[index];
      if slot.key.load(Ordering::Relaxed) == VACANT {
        slot.node.store(Some(node));
        slot.key.store(location, Ordering::Release);
        self.len.fetch_add(1, Ordering::Relaxed);
        return;
      }
      index = (index + 1) & self.mask;
    }
  }

  fn len(&self) -> usize {
    self.len.load(Ordering::Relaxed)
  }

  fn new(capacity: usize) -> Self {
    let capacity = capacity.next_power_of_two().max(INITIAL_CAPACITY);

    let slots = (0..capacity)
      .map(|_| ChildSlot {
        key: AtomicU32::new(VACANT),
        node: ArcSwapOption::const_empty(),
      })
      .collect::<Vec<_>>()
      .into_boxed_slice();

    Self {
      len: AtomicUsize::new(0),
      mask: capacity - 1,
      slots,
    }
  }

  /// Build a doubled table containing every existing child exactly once
  /// plus the new entry.
  fn rehashed_with(
    &self,
    location: LocationId,
    node: Arc<CounterNode>,
  ) -> Self {
    let grown = Self::new(self.capacity() * 2);

    for slot in &self.slots {
      let key = slot.key.load(Ordering::Acquire);
      if key != VACANT
        && let Some(existing) = slot.node.load_full()
      {
        grown.insert(key, existing);
      }
    }

    grown.insert(location, node);
    grown
  }
}

fn lock_ignoring_poison(lock: &Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
  match lock.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

/// Fibonacci spread so dense interner ids do not cluster in low slots.
fn spread(location: LocationId) -> usize {
  location.wrapping_mul(0x9E37_79B9) as usize
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn take_count_drains_and_resets() {
    let node = CounterNode::new(1, None);
    node.increment_count();
    node.increment_count();

    assert_eq!(node.take_count(), 2);
    assert_eq!(node.take_count(), 0);
  }

  #[test]
  fn sized_increment_updates_size_and_histogram() {
    let spec = Arc::new(HistogramSpec::new(vec![4, 16]));
    let node = CounterNode::new(1, Some(spec));

    node.increment_size_and_count(3);
    node.increment_size_and_count(10);
    node.increment_size_and_count(1000);

    assert_eq!(node.take_count(), 3);
    assert_eq!(node.take_size(), 1013);
    assert_eq!(node.take_buckets(), Some(vec![1, 1, 1]));
    assert_eq!(node.take_buckets(), Some(vec![0, 0, 0]));
  }

  #[test]
  fn children_are_created_once_and_found_again() {
    let node = CounterNode::new(0, None);
    let first = node.get_or_create_child(7);
    let second = node.get_or_create_child(7);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(node.children().len(), 1);
  }

  #[test]
  fn rehash_preserves_every_child_exactly_once() {
    let node = CounterNode::new(0, None);
    let mut created = Vec::new();

    // Enough inserts to force several table replacements.
    for location in 1..=64 {
      created.push(node.get_or_create_child(location));
    }

    let mut found = node
      .children()
      .iter()
      .map(|child| child.location())
      .collect::<Vec<_>>();
    found.sort_unstable();

    assert_eq!(found, (1..=64).collect::<Vec<_>>());

    for child in &created {
      let again = node.get_or_create_child(child.location());
      assert!(Arc::ptr_eq(child, &again));
    }
  }

  #[test]
  fn children_inherit_histogram_spec() {
    let spec = Arc::new(HistogramSpec::new(vec![8]));
    let node = CounterNode::new(0, Some(Arc::clone(&spec)));
    let child = node.get_or_create_child(3);

    child.increment_size_and_count(100);
    assert_eq!(child.take_buckets(), Some(vec![0, 1]));
  }

  #[test]
  fn overflow_threshold_sees_deep_counters() {
    let node = CounterNode::new(0, None);
    let child = node.get_or_create_child(1);
    let grandchild = child.get_or_create_child(2);

    for _ in 0..10 {
      grandchild.increment_count();
    }

    assert!(node.is_overflow_threshold(10));
    assert!(!node.is_overflow_threshold(11));
  }

  #[test]
  fn concurrent_increments_are_never_lost() {
    let node = Arc::new(CounterNode::new(1, None));
    let threads: u64 = 8;
    let per_thread: u64 = 10_000;

    let handles: Vec<_> = (0..threads)
      .map(|_| {
        let node = Arc::clone(&node);
        thread::spawn(move || {
          for _ in 0..per_thread {
            node.increment_count();
          }
        })
      })
      .collect();

    for handle in handles {
      handle.join().unwrap();
    }

    assert_eq!(node.take_count(), threads * per_thread);
  }

  #[test]
  fn concurrent_take_and_increment_conserve_total() {
    let node = Arc::new(CounterNode::new(1, None));
    let writers: u32 = 4;
    let per_thread: u64 = 50_000;

    let handles: Vec<_> = (0..writers)
      .map(|_| {
        let node = Arc::clone(&node);
        thread::spawn(move || {
          for _ in 0..per_thread {
            node.increment_count();
          }
        })
      })
      .collect();

    // Interleave takes with the writers; the sum of every take plus the
    // final drain must equal the total increment count.
    let mut collected = 0;
    for _ in 0..100 {
      collected += node.take_count();
    }

    for handle in handles {
      handle.join().unwrap();
    }

    collected += node.take_count();
    assert_eq!(collected, u64::from(writers) * per_thread);
  }

  #[test]
  fn concurrent_child_creation_yields_single_instance() {
    let node = Arc::new(CounterNode::new(0, None));

    let handles: Vec<_> = (0..8)
      .map(|_| {
        let node = Arc::clone(&node);
        thread::spawn(move || {
          (1..=32)
            .map(|location| {
              let child = node.get_or_create_child(location);
              child.increment_count();
              Arc::as_ptr(&child) as usize
            })
            .collect::<Vec<_>>()
        })
      })
      .collect();

    let results: Vec<Vec<usize>> =
      handles.into_iter().map(|h| h.join().unwrap()).collect();

    for pointers in &results[1..] {
      assert_eq!(pointers, &results[0]);
    }

    let total: u64 = node
      .children()
      .iter()
      .map(|child| child.take_count())
      .sum();
    assert_eq!(total, 8 * 32);
  }
}

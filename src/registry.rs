use std::{
  fmt,
  sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, AtomicI64, Ordering},
  },
};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::config::EngineConfig;
use crate::counter::{CounterHandle, CounterNode};
use crate::histogram::HistogramSpec;
use crate::interner::{Interner, LocationId, UNKNOWN_LOCATION};
use crate::snapshot::SnapshotNode;

/// Instance size not yet measured.
pub const SIZE_UNKNOWN: i64 = 0;

/// Sentinel for a type whose size measurement failed; never retried.
pub const SIZE_PROBE_FAILED: i64 = -1;

/// Host-supplied size measurement, invoked at most once per type.
///
/// Replaces runtime object-layout introspection, which is not portable; the
/// integration layer knows how big its instances are.
pub trait SizeProbe: Send + Sync {
  /// Fixed per-instance size in bytes, or `None` when the type cannot be
  /// measured.
  fn instance_size(&self, type_name: &str) -> Option<i64>;
}

/// Per-data-type record: canonical name, fixed instance size, optional
/// array-length histogram, and the root of the type's counter tree.
pub struct TypeIndex {
  histogram: Option<Arc<HistogramSpec>>,
  instance_size: AtomicI64,
  name: Arc<str>,
  root: Arc<CounterNode>,
}

impl fmt::Debug for TypeIndex {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TypeIndex")
      .field("name", &self.name)
      .field("instance_size", &self.instance_size)
      .field("is_array", &self.is_array())
      .finish_non_exhaustive()
  }
}

impl TypeIndex {
  #[must_use]
  pub fn histogram(&self) -> Option<&Arc<HistogramSpec>> {
    self.histogram.as_ref()
  }

  /// Fixed per-instance size in bytes; [`SIZE_UNKNOWN`] until measured,
  /// [`SIZE_PROBE_FAILED`] if measurement failed.
  #[must_use]
  pub fn instance_size(&self) -> i64 {
    self.instance_size.load(Ordering::Relaxed)
  }

  #[must_use]
  pub fn is_array(&self) -> bool {
    self.histogram.is_some()
  }

  /// Record that size measurement failed; downstream reporting treats the
  /// sentinel as zero bytes. A size that was already measured wins.
  pub fn mark_size_probe_failed(&self) {
    let _ = self.instance_size.compare_exchange(
      SIZE_UNKNOWN,
      SIZE_PROBE_FAILED,
      Ordering::AcqRel,
      Ordering::Acquire,
    );
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  fn new(name: Arc<str>, histogram: Option<Arc<HistogramSpec>>) -> Self {
    let root =
      Arc::new(CounterNode::new(UNKNOWN_LOCATION, histogram.clone()));
    Self {
      histogram,
      instance_size: AtomicI64::new(SIZE_UNKNOWN),
      name,
      root,
    }
  }

  #[must_use]
  pub fn root(&self) -> &Arc<CounterNode> {
    &self.root
  }

  /// Write the fixed size exactly once: the first successful measurement
  /// wins and later calls are no-ops. Returns whether this call set it.
  pub fn set_size_if_unknown(&self, measured: i64) -> bool {
    measured > 0
      && self
        .instance_size
        .compare_exchange(
          SIZE_UNKNOWN,
          measured,
          Ordering::AcqRel,
          Ordering::Acquire,
        )
        .is_ok()
  }
}

/// Thin builder that customizes `EngineConfig` without exposing all knobs
/// up front.
#[derive(Default)]
pub struct RegistryBuilder {
  config: EngineConfig,
  size_probe: Option<Box<dyn SizeProbe>>,
}

impl RegistryBuilder {
  #[must_use]
  pub fn finish(self) -> Registry {
    Registry::with_parts(self.config, self.size_probe)
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      config: EngineConfig::default(),
      size_probe: None,
    }
  }

  #[must_use]
  pub fn overflow_threshold(mut self, threshold: u64) -> Self {
    self.config.overflow_threshold = threshold.max(1);
    self
  }

  #[must_use]
  pub fn size_probe(mut self, probe: Box<dyn SizeProbe>) -> Self {
    self.size_probe = Some(probe);
    self
  }

  #[must_use]
  pub fn start_enabled(mut self, enabled: bool) -> Self {
    self.config.start_enabled = enabled;
    self
  }

  #[must_use]
  pub fn track_unknown(mut self, track: bool) -> Self {
    self.config.track_unknown = track;
    self
  }

  #[must_use]
  pub fn with_config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }
}

struct RegistryInner {
  config: EngineConfig,
  enabled: AtomicBool,
  interner: Interner,
  size_probe: Option<Box<dyn SizeProbe>>,
  /// Serializes snapshot taking: at most one snapshot is in flight, so the
  /// fold can assume no concurrent take on any counter.
  snapshot_lock: Mutex<()>,
  /// Counters drained out of band by the overflow watchdog, merged into the
  /// next regular snapshot so nothing is lost or double-counted.
  spill: Mutex<SnapshotNode>,
  types: DashMap<Arc<str>, Arc<TypeIndex>>,
}

/// Entry point for registering types/locations, recording allocations, and
/// producing snapshots.
///
/// One explicit context object constructed at process start and cloned into
/// every component that needs it; there are no process-wide statics.
#[derive(Clone)]
pub struct Registry {
  inner: Arc<RegistryInner>,
}

impl fmt::Debug for Registry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Registry")
      .field("enabled", &self.enabled())
      .field("types", &self.inner.types.len())
      .field("locations", &self.inner.interner.len())
      .finish_non_exhaustive()
  }
}

impl Default for Registry {
  fn default() -> Self {
    Self::new()
  }
}

impl Registry {
  #[must_use]
  pub fn builder() -> RegistryBuilder {
    RegistryBuilder::new()
  }

  #[must_use]
  pub fn config(&self) -> &EngineConfig {
    &self.inner.config
  }

  pub fn disable(&self) {
    self.inner.enabled.store(false, Ordering::Release);
  }

  /// Fold all live counters into the internal spill tree without waiting
  /// for the next regular snapshot.
  ///
  /// The watchdog calls this when a counter approaches overflow; the spill
  /// is merged into the next [`Registry::take_snapshot`], so draining early
  /// never creates or destroys counted allocations.
  pub fn drain_overflow(&self) {
    let _guard = lock_ignoring_poison(&self.inner.snapshot_lock);

    let mut drained = SnapshotNode::root();
    self.fold_all(&mut drained);

    let mut spill = lock_spill(&self.inner.spill);
    spill.add_deep(&drained, &self.inner.config.unknown_label);

    debug!(count = drained.count(), "drained counters out of band");
  }

  pub fn enable(&self) {
    self.inner.enabled.store(true, Ordering::Release);
  }

  #[must_use]
  pub fn enabled(&self) -> bool {
    self.inner.enabled.load(Ordering::Acquire)
  }

  /// Record one allocation against a resolved counter.
  pub fn increment(&self, handle: &CounterHandle) {
    if self.enabled() {
      handle.increment_count();
    }
  }

  /// Record one array allocation of the given length.
  ///
  /// Negative lengths mean the allocation will fail upstream; the call is
  /// skipped without touching any counter.
  pub fn increment_array(&self, handle: &CounterHandle, length: i64) {
    if length < 0 || !self.enabled() {
      return;
    }
    handle.increment_size_and_count(length.unsigned_abs());
  }

  /// Record one variable-size allocation of the given size in bytes.
  ///
  /// Negative sizes are skipped, same as [`Registry::increment_array`].
  pub fn increment_sized(&self, handle: &CounterHandle, size: i64) {
    if size < 0 || !self.enabled() {
      return;
    }
    handle.increment_size_and_count(size.unsigned_abs());
  }

  #[must_use]
  pub fn interner(&self) -> &Interner {
    &self.inner.interner
  }

  /// Whether any type's counter tree holds a counter at or above the
  /// configured overflow high-water mark.
  #[must_use]
  pub fn is_overflow_threshold(&self) -> bool {
    let limit = self.inner.config.overflow_threshold;
    self
      .inner
      .types
      .iter()
      .any(|entry| entry.value().root().is_overflow_threshold(limit))
  }

  #[must_use]
  pub fn new() -> Self {
    Self::with_config(EngineConfig::default())
  }

  /// Intern a location string; called at setup/load time, not per
  /// allocation.
  pub fn register_location(&self, name: &str) -> LocationId {
    self.inner.interner.register(name)
  }

  /// Register an array type with a length histogram.
  ///
  /// `breakpoints` of `None` uses the configured defaults. If the type was
  /// already registered, the existing entry (and its histogram) wins.
  pub fn register_array_type(
    &self,
    name: &str,
    breakpoints: Option<Vec<u64>>,
  ) -> Arc<TypeIndex> {
    let spec = Arc::new(HistogramSpec::new(
      breakpoints
        .unwrap_or_else(|| self.inner.config.default_breakpoints.clone()),
    ));
    self.register_with(name, Some(spec))
  }

  /// Register (or fetch) the index for a type name.
  ///
  /// Idempotent: exactly one `TypeIndex` exists per canonical name even
  /// under racing registrations.
  pub fn register_type(&self, name: &str) -> Arc<TypeIndex> {
    self.register_with(name, None)
  }

  /// Drain every counter, discarding the result.
  pub fn reset(&self) {
    let _ = self.take_snapshot();
  }

  /// Resolve the counter for a (type, call-context) pair, creating any
  /// missing tree nodes on the way down.
  ///
  /// An empty path resolves to the type's root counter (the construction
  /// hook's target); each path element descends one call-context level.
  /// Instrumentation resolves once per site and caches the handle.
  pub fn resolve_counter_node(
    &self,
    type_name: &str,
    path: &[LocationId],
  ) -> CounterHandle {
    let index = self.register_type(type_name);
    let mut node = Arc::clone(index.root());
    for &location in path {
      node = node.get_or_create_child(location);
    }
    node
  }

  /// First successful size measurement for a type wins; later calls are
  /// no-ops.
  pub fn set_size_if_unknown(&self, type_name: &str, measured: i64) {
    let index = self.register_type(type_name);
    let _ = index.set_size_if_unknown(measured);
  }

  /// Take a transactional snapshot of all live counters as a fresh tree.
  ///
  /// Counters are zeroed as they are read; the returned tree is a private
  /// copy the caller may merge or serialize without further
  /// synchronization.
  #[must_use]
  pub fn take_snapshot(&self) -> SnapshotNode {
    let mut root = SnapshotNode::root();
    self.take_snapshot_into(&mut root);
    root
  }

  /// Take a transactional snapshot, folding it into `target`.
  ///
  /// `target` is typically a caller-owned cumulative tree; the fold applies
  /// the unknown-bucket reshaping rules whenever the tracked tree's shape
  /// changed since the tree was last updated.
  pub fn take_snapshot_into(&self, target: &mut SnapshotNode) {
    let _guard = lock_ignoring_poison(&self.inner.snapshot_lock);

    target.sort_children_deep();

    {
      let mut spill = lock_spill(&self.inner.spill);
      if !spill.is_zero() {
        target.add_deep(&spill, &self.inner.config.unknown_label);
        *spill = SnapshotNode::root();
      }
    }

    self.fold_all(target);
  }

  #[must_use]
  pub fn with_config(config: EngineConfig) -> Self {
    Self::with_parts(config, None)
  }

  fn canonical_name<'a>(&self, name: &'a str) -> &'a str {
    let cut = self
      .inner
      .config
      .proxy_markers
      .iter()
      .filter_map(|marker| name.find(marker.as_str()))
      .min();

    match cut {
      Some(index) if index > 0 => &name[..index],
      _ => name,
    }
  }

  /// Visit every type in stable name-sorted order and drain its counter
  /// tree into `target`, then rebuild the parent caches bottom-up.
  fn fold_all(&self, target: &mut SnapshotNode) {
    let mut types: Vec<Arc<TypeIndex>> = self
      .inner
      .types
      .iter()
      .map(|entry| Arc::clone(entry.value()))
      .collect();
    types.sort_by(|a, b| a.name().cmp(b.name()));

    for index in &types {
      let snap = target.find_or_create_child(index.name(), index.is_array());
      self.fold_type(index, snap);
    }

    target.update_sums();
  }

  /// Drain one counter subtree into its snapshot mirror, matching children
  /// by resolved location name. Returns the subtree's count delta.
  fn fold_node(
    &self,
    node: &CounterNode,
    snap: &mut SnapshotNode,
    index: &TypeIndex,
  ) -> i64 {
    let label = &self.inner.config.unknown_label;

    let count = i64::try_from(node.take_count()).unwrap_or(i64::MAX);
    let tracked_size = i64::try_from(node.take_size()).unwrap_or(i64::MAX);
    let size = if index.is_array() {
      tracked_size
    } else {
      count.saturating_mul(index.instance_size().max(0))
    };
    let buckets = node.take_buckets();

    let children = self.sorted_children(node);

    // Shape rule: totals accumulated while this node was a leaf move into
    // the unknown bucket the moment real children appear beneath it.
    if !children.is_empty() && snap.children().is_empty() {
      snap.push_down_into_unknown(label);
    }

    let has_own = count != 0
      || size != 0
      || buckets
        .as_ref()
        .is_some_and(|b| b.iter().any(|&bucket| bucket != 0));

    if has_own {
      if children.is_empty() && snap.children().is_empty() {
        snap.deposit(count, size, buckets.as_deref());
      } else {
        snap
          .find_or_create_child(label, index.is_array())
          .deposit(count, size, buckets.as_deref());
      }
    }

    let mut subtotal = count;
    for (name, child) in &children {
      let child_snap = snap.find_or_create_child(name, index.is_array());
      subtotal += self.fold_node(child, child_snap, index);
    }

    subtotal
  }

  /// Drain one type's tree into its snapshot node, reconciling the
  /// construction-hook counter at the root against the allocation-site
  /// children so each allocation is counted exactly once.
  fn fold_type(&self, index: &TypeIndex, snap: &mut SnapshotNode) {
    let config = &self.inner.config;
    let label = &config.unknown_label;
    let root = index.root();

    let direct_count = i64::try_from(root.take_count()).unwrap_or(i64::MAX);
    let direct_tracked =
      i64::try_from(root.take_size()).unwrap_or(i64::MAX);
    let direct_size = if index.is_array() {
      direct_tracked
    } else {
      direct_count.saturating_mul(index.instance_size().max(0))
    };
    let direct_buckets = root.take_buckets();

    let children = self.sorted_children(root);

    if !children.is_empty() && snap.children().is_empty() {
      snap.push_down_into_unknown(label);
    }

    let mut clone_delta = 0i64;
    let mut site_delta = 0i64;

    for (name, child) in &children {
      let child_snap = snap.find_or_create_child(name, index.is_array());
      let delta = self.fold_node(child, child_snap, index);
      if name.ends_with(config.clone_suffix.as_str()) {
        clone_delta += delta;
      } else {
        site_delta += delta;
      }
    }

    if config.track_unknown && !index.is_array() {
      // The root counter saw every construction hook (regular and clone
      // paths); clone-marked children already account for the clone share.
      // Whatever the non-clone sites did not claim was constructed through
      // an untracked path and belongs to the unknown bucket.
      let hook_delta = direct_count - clone_delta;
      let unattributed = hook_delta - site_delta;

      if unattributed < 0 {
        // A site counted an allocation whose construction hook never ran:
        // the optimizer eliminated it. Expected; clamp rather than report
        // a negative total.
        snap.mark_possibly_eliminated();
      }

      let clamped = unattributed.max(0);
      if clamped > 0 {
        let size = clamped.saturating_mul(index.instance_size().max(0));
        if snap.children().is_empty() {
          snap.deposit(clamped, size, None);
        } else {
          snap
            .find_or_create_child(label, false)
            .deposit(clamped, size, None);
        }
      }
    } else {
      let has_direct = direct_count != 0
        || direct_size != 0
        || direct_buckets
          .as_ref()
          .is_some_and(|b| b.iter().any(|&bucket| bucket != 0));

      if has_direct {
        if snap.children().is_empty() {
          snap.deposit(direct_count, direct_size, direct_buckets.as_deref());
        } else {
          snap
            .find_or_create_child(label, index.is_array())
            .deposit(direct_count, direct_size, direct_buckets.as_deref());
        }
      }
    }

    snap.update_sums();
  }

  fn register_with(
    &self,
    name: &str,
    histogram: Option<Arc<HistogramSpec>>,
  ) -> Arc<TypeIndex> {
    let canonical = self.canonical_name(name);

    if let Some(existing) = self.inner.types.get(canonical) {
      return Arc::clone(existing.value());
    }

    match self.inner.types.entry(Arc::from(canonical)) {
      Entry::Occupied(entry) => Arc::clone(entry.get()),
      Entry::Vacant(entry) => {
        let index =
          Arc::new(TypeIndex::new(Arc::clone(entry.key()), histogram));

        if !index.is_array()
          && let Some(probe) = &self.inner.size_probe
        {
          match probe.instance_size(index.name()) {
            Some(measured) if measured > 0 => {
              let _ = index.set_size_if_unknown(measured);
            }
            _ => index.mark_size_probe_failed(),
          }
        }

        debug!(name = index.name(), "registered type");
        entry.insert(Arc::clone(&index));
        index
      }
    }
  }

  fn sorted_children(
    &self,
    node: &CounterNode,
  ) -> Vec<(Arc<str>, Arc<CounterNode>)> {
    let label = &self.inner.config.unknown_label;

    let mut children: Vec<(Arc<str>, Arc<CounterNode>)> = node
      .children()
      .into_iter()
      .map(|child| {
        let name = self
          .inner
          .interner
          .resolve(child.location())
          .unwrap_or_else(|| Arc::from(label.as_str()));
        (name, child)
      })
      .collect();

    children.sort_by(|a, b| a.0.cmp(&b.0));
    children
  }

  fn with_parts(
    config: EngineConfig,
    size_probe: Option<Box<dyn SizeProbe>>,
  ) -> Self {
    let enabled = AtomicBool::new(config.start_enabled);
    let interner = Interner::new(&config.unknown_label);

    let inner = RegistryInner {
      config,
      enabled,
      interner,
      size_probe,
      snapshot_lock: Mutex::new(()),
      spill: Mutex::new(SnapshotNode::root()),
      types: DashMap::new(),
    };

    Self {
      inner: Arc::new(inner),
    }
  }
}

fn lock_ignoring_poison(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
  match lock.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

fn lock_spill(lock: &Mutex<SnapshotNode>) -> MutexGuard<'_, SnapshotNode> {
  match lock.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

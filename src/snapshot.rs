use super::*;

/// One node of a point-in-time or cumulative report tree.
///
/// Mirrors a counter subtree but is single-writer: counters are plain
/// integers and children live in a growable array kept sorted by name. The
/// merge operations below require both operands to be name-sorted; trees
/// built by this crate are sorted by construction, trees received from
/// elsewhere (deserialized, hand-built) must go through
/// [`SnapshotNode::sort_children_deep`] first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  children: Vec<SnapshotNode>,
  count: i64,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  histogram: Vec<i64>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  is_array: bool,
  name: Arc<str>,
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  possibly_eliminated: bool,
  size: i64,
}

impl SnapshotNode {
  /// Merge `other` into `self`, adding counters of children matched by name.
  ///
  /// Both trees must be name-sorted. Whenever one side has children and the
  /// other carries a bare total, the bare total is routed through the
  /// unknown bucket so no counted allocation is silently reattributed.
  pub fn add_deep(&mut self, other: &SnapshotNode, unknown_label: &str) {
    self.merge_deep(other, 1, unknown_label);
  }

  #[must_use]
  pub fn child(&self, name: &str) -> Option<&SnapshotNode> {
    self
      .children
      .binary_search_by(|child| child.name.as_ref().cmp(name))
      .ok()
      .map(|index| &self.children[index])
  }

  #[must_use]
  pub fn children(&self) -> &[SnapshotNode] {
    &self.children
  }

  /// Drop descendants whose entire subtree carries zero counters.
  ///
  /// Reporting uses this to hide structure that only exists because an
  /// earlier period created it.
  pub fn compact(&mut self) {
    for child in &mut self.children {
      child.compact();
    }
    self.children.retain(|child| !child.is_zero());
  }

  #[must_use]
  pub fn count(&self) -> i64 {
    self.count
  }

  pub(crate) fn deposit(
    &mut self,
    count: i64,
    size: i64,
    buckets: Option<&[u64]>,
  ) {
    self.count += count;
    self.size += size;

    if let Some(buckets) = buckets {
      if self.histogram.len() < buckets.len() {
        self.histogram.resize(buckets.len(), 0);
      }
      for (slot, &bucket) in self.histogram.iter_mut().zip(buckets) {
        *slot += i64::try_from(bucket).unwrap_or(i64::MAX);
      }
    }
  }

  /// Find the child named `name`, creating a zeroed one in sorted position
  /// if absent. New children inherit the sticky possibly-eliminated flag.
  pub(crate) fn find_or_create_child(
    &mut self,
    name: &str,
    is_array: bool,
  ) -> &mut SnapshotNode {
    let index = match self
      .children
      .binary_search_by(|child| child.name.as_ref().cmp(name))
    {
      Ok(index) => index,
      Err(index) => {
        let mut child = SnapshotNode::new(name);
        child.is_array = is_array;
        child.possibly_eliminated = self.possibly_eliminated;
        self.children.insert(index, child);
        index
      }
    };

    &mut self.children[index]
  }

  #[must_use]
  pub fn histogram(&self) -> &[i64] {
    &self.histogram
  }

  #[must_use]
  pub fn is_array(&self) -> bool {
    self.is_array
  }

  /// Whether this node and every descendant carry only zero counters.
  #[must_use]
  pub fn is_zero(&self) -> bool {
    self.count == 0
      && self.size == 0
      && self.histogram.iter().all(|&bucket| bucket == 0)
      && self.children.iter().all(SnapshotNode::is_zero)
  }

  /// Set the possibly-eliminated flag on this node and its whole subtree.
  ///
  /// The flag only ever transitions off to on and is inherited by children
  /// created later.
  pub fn mark_possibly_eliminated(&mut self) {
    self.possibly_eliminated = true;
    for child in &mut self.children {
      child.mark_possibly_eliminated();
    }
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[must_use]
  pub fn new(name: &str) -> Self {
    Self {
      name: Arc::from(name),
      ..Self::default()
    }
  }

  #[must_use]
  pub fn possibly_eliminated(&self) -> bool {
    self.possibly_eliminated
  }

  /// Move this node's bare totals into a synthetic unknown child.
  ///
  /// Called right before the first real children appear under a node that
  /// already accumulated totals, so the pre-existing total keeps a home and
  /// the parent can become a pure cache of its children.
  pub(crate) fn push_down_into_unknown(&mut self, unknown_label: &str) {
    debug_assert!(self.children.is_empty());

    if self.count == 0 && self.size == 0 && self.histogram.is_empty() {
      return;
    }

    let mut unknown = SnapshotNode::new(unknown_label);
    unknown.count = self.count;
    unknown.size = self.size;
    unknown.histogram = std::mem::take(&mut self.histogram);
    unknown.is_array = self.is_array;
    unknown.possibly_eliminated = self.possibly_eliminated;
    self.children.push(unknown);
  }

  /// An empty tree root ready to receive snapshots.
  #[must_use]
  pub fn root() -> Self {
    Self::new("")
  }

  #[must_use]
  pub fn size(&self) -> i64 {
    self.size
  }

  /// Sort every child list by name, recursively.
  ///
  /// Precondition enforcer for [`SnapshotNode::add_deep`] and
  /// [`SnapshotNode::sub_deep`] on trees not built by this crate.
  pub fn sort_children_deep(&mut self) {
    self.children.sort_by(|a, b| a.name.cmp(&b.name));
    for child in &mut self.children {
      child.sort_children_deep();
    }
  }

  /// Merge `other` out of `self`, subtracting counters of children matched
  /// by name. Same preconditions and unknown-bucket rule as
  /// [`SnapshotNode::add_deep`].
  pub fn sub_deep(&mut self, other: &SnapshotNode, unknown_label: &str) {
    self.merge_deep(other, -1, unknown_label);
  }

  /// Recompute cached totals bottom-up.
  ///
  /// A node with children is a pure cache: its counters become the sum of
  /// its children's. Leaf counters are left untouched; they are the source
  /// of truth.
  pub fn update_sums(&mut self) {
    for child in &mut self.children {
      child.update_sums();
    }

    if self.children.is_empty() {
      return;
    }

    self.count = self.children.iter().map(|child| child.count).sum();
    self.size = self.children.iter().map(|child| child.size).sum();

    let width = self
      .children
      .iter()
      .map(|child| child.histogram.len())
      .max()
      .unwrap_or(0);

    self.histogram.clear();
    self.histogram.resize(width, 0);
    for child in &self.children {
      for (slot, &bucket) in self.histogram.iter_mut().zip(&child.histogram) {
        *slot += bucket;
      }
    }
  }

  fn cloned_with_sign(&self, sign: i64, eliminated: bool) -> SnapshotNode {
    let mut clone = SnapshotNode {
      children: self
        .children
        .iter()
        .map(|child| {
          child.cloned_with_sign(sign, eliminated || self.possibly_eliminated)
        })
        .collect(),
      count: sign * self.count,
      histogram: self.histogram.iter().map(|&bucket| sign * bucket).collect(),
      is_array: self.is_array,
      name: Arc::clone(&self.name),
      possibly_eliminated: self.possibly_eliminated || eliminated,
      size: sign * self.size,
    };
    clone.children.sort_by(|a, b| a.name.cmp(&b.name));
    clone
  }

  fn has_bare_totals(&self) -> bool {
    self.count != 0
      || self.size != 0
      || self.histogram.iter().any(|&bucket| bucket != 0)
  }

  fn merge_deep(&mut self, other: &SnapshotNode, sign: i64, label: &str) {
    // Reshape before any totals move: a childless node gaining structured
    // input first banks its own accumulated total in the unknown bucket.
    if self.children.is_empty() && !other.children.is_empty() {
      self.push_down_into_unknown(label);
    }

    self.count += sign * other.count;
    self.size += sign * other.size;

    if self.histogram.len() < other.histogram.len() {
      self.histogram.resize(other.histogram.len(), 0);
    }
    for (slot, &bucket) in self.histogram.iter_mut().zip(&other.histogram) {
      *slot += sign * bucket;
    }

    if other.possibly_eliminated {
      self.mark_possibly_eliminated();
    }

    if other.children.is_empty() {
      if !self.children.is_empty() && other.has_bare_totals() {
        // Structured self, bare other: the incoming total lands in the
        // unknown bucket so the parent stays the sum of its children.
        let unknown = self.find_or_create_child(label, other.is_array);
        unknown.count += sign * other.count;
        unknown.size += sign * other.size;
        if unknown.histogram.len() < other.histogram.len() {
          unknown.histogram.resize(other.histogram.len(), 0);
        }
        for (slot, &bucket) in
          unknown.histogram.iter_mut().zip(&other.histogram)
        {
          *slot += sign * bucket;
        }
      }
      return;
    }

    let eliminated = self.possibly_eliminated;
    let mine = std::mem::take(&mut self.children);
    let mut merged = Vec::with_capacity(mine.len().max(other.children.len()));
    let mut a = mine.into_iter().peekable();
    let mut b = other.children.iter().peekable();

    // Linear merge of two name-sorted sequences; repeated lookups would make
    // long-running cumulative merges quadratic.
    loop {
      match (a.peek(), b.peek()) {
        (Some(x), Some(y)) => match x.name.cmp(&y.name) {
          CmpOrdering::Less => merged.push(a.next().expect("peeked")),
          CmpOrdering::Greater => {
            let incoming = b.next().expect("peeked");
            merged.push(incoming.cloned_with_sign(sign, eliminated));
          }
          CmpOrdering::Equal => {
            let mut mine = a.next().expect("peeked");
            mine.merge_deep(b.next().expect("peeked"), sign, label);
            merged.push(mine);
          }
        },
        (Some(_), None) => merged.push(a.next().expect("peeked")),
        (None, Some(_)) => {
          let incoming = b.next().expect("peeked");
          merged.push(incoming.cloned_with_sign(sign, eliminated));
        }
        (None, None) => break,
      }
    }

    self.children = merged;
  }
}

/// Array-length bucketing configuration shared by every counter node of an
/// array type.
///
/// A spec with breakpoints `[b0 < b1 < … < bk]` produces `k + 2` buckets:
/// one per breakpoint (lengths less than or equal to it) plus a trailing
/// overflow bucket for lengths beyond `bk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramSpec {
  breakpoints: Box<[u64]>,
}

impl HistogramSpec {
  /// Route a length to its bucket index.
  ///
  /// Lengths at or below the smallest breakpoint take bucket 0 without a
  /// scan; lengths not covered by any breakpoint take the overflow bucket.
  #[must_use]
  pub fn bucket_for(&self, length: u64) -> usize {
    match self.breakpoints.first() {
      Some(&first) if length <= first => 0,
      Some(_) => self
        .breakpoints
        .iter()
        .position(|&breakpoint| length <= breakpoint)
        .unwrap_or(self.breakpoints.len()),
      None => 0,
    }
  }

  #[must_use]
  pub fn bucket_count(&self) -> usize {
    self.breakpoints.len() + 1
  }

  #[must_use]
  pub fn breakpoints(&self) -> &[u64] {
    &self.breakpoints
  }

  /// Build a spec from breakpoints, sorting and deduplicating them.
  #[must_use]
  pub fn new(mut breakpoints: Vec<u64>) -> Self {
    breakpoints.sort_unstable();
    breakpoints.dedup();
    Self {
      breakpoints: breakpoints.into_boxed_slice(),
    }
  }
}

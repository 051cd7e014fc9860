use std::time::Duration;

/// Controls attribution, reconciliation, and draining policy for the engine.
///
/// Every numeric policy knob lives here rather than in the modules that
/// consume it; the defaults are reasonable for a long-running server process
/// but hosts are expected to tune them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Location-name suffix that marks counters recorded through a clone path
  /// rather than a regular construction path.
  pub clone_suffix: String,
  /// Array-length histogram breakpoints used for array types registered
  /// without an explicit histogram. Must be strictly increasing.
  pub default_breakpoints: Vec<u64>,
  /// High-water mark at which a counter is considered close enough to
  /// overflow that the watchdog should drain it out of band.
  pub overflow_threshold: u64,
  /// Substrings that mark the start of a generated-proxy suffix in a type
  /// name. Everything from the first marker onward is stripped when
  /// computing the canonical type name.
  pub proxy_markers: Vec<String>,
  /// Whether record calls are applied immediately once the registry exists.
  pub start_enabled: bool,
  /// Whether to reconcile constructor-hook counts against allocation-site
  /// counts for non-array types and attribute the residue to the unknown
  /// bucket.
  pub track_unknown: bool,
  /// Name given to synthetic children that absorb unattributed totals.
  pub unknown_label: String,
  /// How often the overflow watchdog wakes up to inspect the counter trees.
  pub watchdog_interval: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      clone_suffix: "#clone".to_string(),
      default_breakpoints: vec![8, 64, 512, 4096],
      overflow_threshold: 1 << 30,
      proxy_markers: vec!["$$".to_string()],
      start_enabled: true,
      track_unknown: true,
      unknown_label: "<unknown>".to_string(),
      watchdog_interval: Duration::from_secs(1),
    }
  }
}

impl EngineConfig {
  /// Explicitly disable eager recording at construction time.
  #[must_use]
  pub fn disabled(mut self) -> Self {
    self.start_enabled = false;
    self
  }

  /// Builder-style helper to replace the default histogram breakpoints.
  #[must_use]
  pub fn with_default_breakpoints(mut self, breakpoints: Vec<u64>) -> Self {
    self.default_breakpoints = breakpoints;
    self
  }

  /// Builder-style helper to adjust the overflow high-water mark.
  #[must_use]
  pub fn with_overflow_threshold(mut self, threshold: u64) -> Self {
    self.overflow_threshold = threshold.max(1);
    self
  }
}

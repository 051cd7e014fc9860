//! Allocation-counting index and snapshot/diff engine.
//!
//! The crate attributes allocations to a (type, call-context) pair through a
//! concurrent tree of atomic counters, and periodically folds those counters
//! into consistent point-in-time and cumulative report trees. Increments are
//! lock-free on the common path; snapshot taking is the single serialized
//! operation and atomically zeroes each counter as it reads it, so no
//! allocation is ever lost or counted twice across consecutive reports.
//!
//! The instrumentation layer that decides where counting calls go, and the
//! transport that delivers rendered reports, live outside this crate; they
//! consume the [`Registry`] and [`SnapshotNode`] APIs.

mod config;
mod context;
mod counter;
mod export;
mod histogram;
mod interner;
mod registry;
mod snapshot;
mod watchdog;

use {
  serde::{Deserialize, Serialize},
  std::{
    cmp::Ordering as CmpOrdering,
    fmt::{self, Display, Formatter},
    io::{self, Write},
    sync::Arc,
    time::SystemTime,
  },
};

pub use {
  config::EngineConfig,
  context::{LocationGuard, context_depth, current_context, enter_location},
  counter::{CounterHandle, CounterNode},
  export::{ExportError, JsonLinesWriter, SnapshotStreamWriter},
  histogram::HistogramSpec,
  interner::{Interner, LocationId, UNKNOWN_LOCATION},
  registry::{
    Registry, RegistryBuilder, SIZE_PROBE_FAILED, SIZE_UNKNOWN, SizeProbe,
    TypeIndex,
  },
  snapshot::SnapshotNode,
  watchdog::OverflowWatchdog,
};

use std::{
  sync::{Arc, Condvar, Mutex},
  thread,
  time::Duration,
};

use tracing::{debug, warn};

use crate::registry::Registry;

#[derive(Debug)]
struct Shared {
  stop: Mutex<bool>,
  wake: Condvar,
}

/// Background thread that drains counters before they can wrap.
///
/// Wakes on the configured interval, asks the registry whether any counter
/// tree is near the overflow high-water mark, and forces an out-of-band
/// drain if so. The drained counters are folded into the registry's spill
/// tree and surface in the next regular snapshot, so the early drain is
/// invisible to reporting totals.
#[derive(Debug)]
pub struct OverflowWatchdog {
  handle: Option<thread::JoinHandle<()>>,
  shared: Arc<Shared>,
}

impl OverflowWatchdog {
  /// Spawn the watchdog using the registry's configured interval.
  #[must_use]
  pub fn spawn(registry: Registry) -> Self {
    Self::spawn_with_interval(registry, None)
  }

  /// Spawn the watchdog with an explicit wake interval.
  #[must_use]
  pub fn spawn_with_interval(
    registry: Registry,
    interval: Option<Duration>,
  ) -> Self {
    let interval = interval.unwrap_or(registry.config().watchdog_interval);
    let shared = Arc::new(Shared {
      stop: Mutex::new(false),
      wake: Condvar::new(),
    });

    let worker_shared = Arc::clone(&shared);
    let handle = thread::Builder::new()
      .name("alloctally-watchdog".to_string())
      .spawn(move || run(&registry, &worker_shared, interval))
      .expect("failed to spawn watchdog thread");

    Self {
      handle: Some(handle),
      shared,
    }
  }

  /// Stop the watchdog and wait for its thread to exit.
  pub fn stop(mut self) {
    self.stop_inner();
  }

  fn stop_inner(&mut self) {
    if let Ok(mut stop) = self.shared.stop.lock() {
      *stop = true;
    }
    self.shared.wake.notify_all();

    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for OverflowWatchdog {
  fn drop(&mut self) {
    self.stop_inner();
  }
}

fn run(registry: &Registry, shared: &Shared, interval: Duration) {
  debug!(?interval, "overflow watchdog running");

  loop {
    let mut stop = match shared.stop.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    };

    while !*stop {
      let (guard, timeout) = match shared.wake.wait_timeout(stop, interval) {
        Ok(result) => result,
        Err(err) => {
          let (guard, timeout) = err.into_inner();
          (guard, timeout)
        }
      };
      stop = guard;
      if timeout.timed_out() {
        break;
      }
    }

    if *stop {
      return;
    }
    drop(stop);

    if registry.is_overflow_threshold() {
      warn!("counter near overflow threshold, draining out of band");
      registry.drain_overflow();
    }
  }
}

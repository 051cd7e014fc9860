use std::{sync::Arc, thread, time::Duration};

use alloctally::{Registry, SnapshotNode};

const UNKNOWN: &str = "<unknown>";

#[test]
fn end_to_end_single_site_million_allocations() {
  let registry = Registry::new();
  registry.set_size_if_unknown("Entity", 48);

  let site = registry.register_location("Game.spawn");
  let hook = registry.resolve_counter_node("Entity", &[]);
  let at_site = registry.resolve_counter_node("Entity", &[site]);

  let before = registry.take_snapshot();
  assert!(before.is_zero());

  for _ in 0..1_000_000 {
    registry.increment(&hook);
    registry.increment(&at_site);
  }

  let after = registry.take_snapshot();
  let entity = after.child("Entity").expect("missing Entity");

  assert_eq!(entity.count(), 1_000_000);
  assert_eq!(entity.size(), 1_000_000 * 48);
  assert_eq!(entity.children().len(), 1);
  assert_eq!(entity.child("Game.spawn").unwrap().count(), 1_000_000);
  assert!(!entity.possibly_eliminated());
}

#[test]
fn concurrent_increments_and_snapshots_conserve_counts() {
  let registry = Registry::new();
  let writers: u64 = 8;
  let per_thread: u64 = 100_000;

  let site = registry.register_location("Worker.run");
  let at_site = registry.resolve_counter_node("Entity", &[site]);

  let handles: Vec<_> = (0..writers)
    .map(|_| {
      let registry = registry.clone();
      let at_site = Arc::clone(&at_site);
      thread::spawn(move || {
        for _ in 0..per_thread {
          registry.increment(&at_site);
        }
      })
    })
    .collect();

  // Snapshot repeatedly while the writers run; every take must be merged,
  // and the grand total must come out exact.
  let mut cumulative = SnapshotNode::root();
  for _ in 0..50 {
    registry.take_snapshot_into(&mut cumulative);
    thread::sleep(Duration::from_millis(1));
  }

  for handle in handles {
    handle.join().unwrap();
  }
  registry.take_snapshot_into(&mut cumulative);

  let expected = i64::try_from(writers * per_thread).unwrap();
  let entity = cumulative.child("Entity").expect("missing Entity");
  assert_eq!(entity.count(), expected);
  assert_eq!(entity.child("Worker.run").unwrap().count(), expected);
}

#[test]
fn concurrent_site_growth_conserves_counts() {
  let registry = Registry::new();
  let threads: u64 = 8;
  let sites: u64 = 32;
  let per_site: u64 = 1_000;

  let site_ids: Vec<_> = (0..sites)
    .map(|i| registry.register_location(&format!("site.{i:02}")))
    .collect();

  let handles: Vec<_> = (0..threads)
    .map(|_| {
      let registry = registry.clone();
      let site_ids = site_ids.clone();
      thread::spawn(move || {
        for &site in &site_ids {
          // Resolution races child creation across threads on purpose.
          let handle = registry.resolve_counter_node("Entity", &[site]);
          for _ in 0..per_site {
            registry.increment(&handle);
          }
        }
      })
    })
    .collect();

  for handle in handles {
    handle.join().unwrap();
  }

  let snapshot = registry.take_snapshot();
  let entity = snapshot.child("Entity").expect("missing Entity");

  let expected_total = i64::try_from(threads * sites * per_site).unwrap();
  assert_eq!(entity.count(), expected_total);

  let real_children = entity
    .children()
    .iter()
    .filter(|child| child.name() != UNKNOWN)
    .count();
  assert_eq!(real_children, usize::try_from(sites).unwrap());

  let per_site_expected = i64::try_from(threads * per_site).unwrap();
  for i in 0..sites {
    let name = format!("site.{i:02}");
    assert_eq!(
      entity.child(&name).unwrap().count(),
      per_site_expected,
      "site {name}"
    );
  }
}

#[test]
fn watchdog_drain_and_periodic_snapshots_agree() {
  let registry = Registry::builder().overflow_threshold(10_000).finish();
  let hook = registry.resolve_counter_node("Buffer", &[]);

  let writer = {
    let registry = registry.clone();
    let hook = Arc::clone(&hook);
    thread::spawn(move || {
      for _ in 0..500_000u64 {
        registry.increment(&hook);
      }
    })
  };

  let watchdog = alloctally::OverflowWatchdog::spawn_with_interval(
    registry.clone(),
    Some(Duration::from_millis(1)),
  );

  let mut cumulative = SnapshotNode::root();
  for _ in 0..20 {
    registry.take_snapshot_into(&mut cumulative);
    thread::sleep(Duration::from_millis(2));
  }

  writer.join().unwrap();
  watchdog.stop();
  registry.take_snapshot_into(&mut cumulative);

  assert_eq!(cumulative.child("Buffer").unwrap().count(), 500_000);
}

#[test]
fn cumulative_and_last_period_trees_diff_cleanly() {
  let registry = Registry::new();
  let site = registry.register_location("Pool.acquire");
  let hook = registry.resolve_counter_node("Entity", &[]);
  let at_site = registry.resolve_counter_node("Entity", &[site]);

  let mut cumulative = SnapshotNode::root();
  let mut previous = SnapshotNode::root();

  for period in 1..=3i64 {
    for _ in 0..(period * 100) {
      registry.increment(&hook);
      registry.increment(&at_site);
    }

    registry.take_snapshot_into(&mut cumulative);

    // last = cumulative - previous, then previous = cumulative.
    let mut last = cumulative.clone();
    last.sub_deep(&previous, UNKNOWN);
    assert_eq!(
      last.child("Entity").unwrap().count(),
      period * 100,
      "period {period}"
    );

    previous = cumulative.clone();
  }

  assert_eq!(cumulative.child("Entity").unwrap().count(), 600);
}

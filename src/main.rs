use alloctally::{Registry, SnapshotNode, current_context, enter_location};

fn main() {
  let registry = Registry::new();
  registry.set_size_if_unknown("Entity", 48);

  let spawn = registry.register_location("Demo.spawn");
  let hook = registry.resolve_counter_node("Entity", &[]);
  let _scope = enter_location(spawn);
  let at_spawn = registry.resolve_counter_node("Entity", &current_context());

  let buffers =
    registry.register_array_type("Buffer[]", Some(vec![16, 256, 4096]));
  let buffer_root = buffers.root().clone();

  for i in 0..1_000i64 {
    registry.increment(&hook);
    registry.increment(&at_spawn);
    registry.increment_array(&buffer_root, i % 512);
  }

  let snapshot = registry.take_snapshot();

  println!("=== demo snapshot ===");
  print_tree(&snapshot, 0);
}

fn print_tree(node: &SnapshotNode, depth: usize) {
  let indent = "  ".repeat(depth);
  let name = if node.name().is_empty() {
    "(total)"
  } else {
    node.name()
  };
  println!(
    "{indent}{name}: count={} size={}B{}",
    node.count(),
    node.size(),
    if node.possibly_eliminated() {
      " (possibly eliminated)"
    } else {
      ""
    }
  );
  for child in node.children() {
    print_tree(child, depth + 1);
  }
}

use std::{cell::RefCell, marker::PhantomData};

use crate::interner::LocationId;

thread_local! {
  static CONTEXT: RefCell<Vec<LocationId>> = const { RefCell::new(Vec::new()) };
}

/// Scoped entry on the calling thread's call-context stack.
///
/// Dropping the guard pops the entry, so a panic unwinding through
/// instrumented code still leaves the stack balanced.
#[derive(Debug)]
#[must_use = "the location is popped when the guard drops"]
pub struct LocationGuard {
  // The guard must drop on the thread whose stack it pushed onto.
  _not_send: PhantomData<*const ()>,
}

impl Drop for LocationGuard {
  fn drop(&mut self) {
    CONTEXT.with(|stack| {
      stack.borrow_mut().pop();
    });
  }
}

/// Depth of the calling thread's context stack.
#[must_use]
pub fn context_depth() -> usize {
  CONTEXT.with(|stack| stack.borrow().len())
}

/// Copy the calling thread's current location stack, outermost first.
///
/// Instrumentation passes the result to
/// [`crate::Registry::resolve_counter_node`] when attributing an allocation.
#[must_use]
pub fn current_context() -> Vec<LocationId> {
  CONTEXT.with(|stack| stack.borrow().clone())
}

/// Push a location onto the calling thread's context stack for the lifetime
/// of the returned guard.
pub fn enter_location(location: LocationId) -> LocationGuard {
  CONTEXT.with(|stack| stack.borrow_mut().push(location));
  LocationGuard {
    _not_send: PhantomData,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn guard_pushes_and_pops() {
    assert_eq!(context_depth(), 0);

    let outer = enter_location(1);
    {
      let _inner = enter_location(2);
      assert_eq!(current_context(), vec![1, 2]);
    }

    assert_eq!(current_context(), vec![1]);
    drop(outer);
    assert_eq!(context_depth(), 0);
  }

  #[test]
  fn panic_unwinding_still_pops() {
    let result = std::panic::catch_unwind(|| {
      let _guard = enter_location(7);
      panic!("instrumented code failed");
    });

    assert!(result.is_err());
    assert_eq!(context_depth(), 0);
  }
}

use std::sync::Arc;
use std::thread;

use blockalloc::{HandleFlags, HandleInfo, State, StateInfo};

/// Walks the default power-of-two handle table and reports, for a
/// representative pointer in each class, where its owning block sits.
fn print_default_table(state: &State) {
  for shift in 0..8u32 {
    let size = 1usize << shift;
    let handle = state.handle_for(size);
    println!(
      "class {size:>4} B -> slot_size = {:>4}, virtual = {}",
      handle.slot_size(),
      handle.is_virtual()
    );
  }
}

/// Demonstrates a dedicated handle with `IMMEDIATE_FREE` set: every
/// `count -> 0` transition releases the block back to the OS instead of
/// keeping one cached, trading reuse speed for a smaller resident set.
fn immediate_free_handle() {
  let state = State::new(Some(StateInfo {
    handles: vec![HandleInfo { alloc_size: 64, block_size: 4096, alignment: 8 }],
    index_fn: Some(|_size| 0),
  }));
  let handle = state.handle_for(64);
  handle.set_flags(HandleFlags::IMMEDIATE_FREE);

  for round in 0..5 {
    let ptr = handle.alloc(64, true);
    println!("round {round}: allocated {ptr:p}");
    handle.free(ptr, 64);
  }
}

/// Spins up a handful of threads hammering the same process-wide state to
/// show that distinct size classes proceed without contending on a shared
/// lock.
fn concurrent_allocations(state: Arc<State>) {
  let mut workers = Vec::new();
  for id in 0..4 {
    let state = Arc::clone(&state);
    workers.push(thread::spawn(move || {
      let size = 1usize << (id + 4);
      let mut live = Vec::new();
      for _ in 0..256 {
        live.push(state.alloc(size, false));
      }
      for ptr in live {
        state.free(ptr, size);
      }
      println!("worker {id}: drained {size} B class");
    }));
  }
  for w in workers {
    w.join().unwrap();
  }
}

fn main() {
  env_logger::init();

  let state = State::new(None);
  print_default_table(&state);

  immediate_free_handle();
  concurrent_allocations(state);
}

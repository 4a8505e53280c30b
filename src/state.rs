//! Library state: a table of handles plus the size→handle dispatch.
//!
//! A [`State`] always holds one more handle than the caller asked for:
//! the last slot is a virtual handle, used whenever dispatch returns an
//! index past the end of the caller-specified table (oversized requests).

use std::sync::Arc;

use crate::handle::{Handle, HandleInfo};

/// Maps a request size to a handle index. Called once per operation, so
/// it should be cheap — the default is an optimized base-2 logarithm.
pub type IndexFn = fn(usize) -> usize;

/// Default dispatch: `index = ceil(log2(size))`, so size classes are the
/// consecutive powers of two `1, 2, 4, 8, ...`.
pub fn default_index(size: usize) -> usize {
  if size <= 1 {
    0
  } else {
    (usize::BITS - (size - 1).leading_zeros()) as usize
  }
}

/// Initialization parameters for [`State::new`]. `None` uses the default
/// table: slot sizes `1, 2, 4, ..., 2^28`, each with an 8 MiB block size
/// and alignment equal to its slot size.
pub struct StateInfo {
  pub handles: Vec<HandleInfo>,
  pub index_fn: Option<IndexFn>,
}

/// Default block size used to build the library's default handle table.
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Largest slot size (`2^28`) in the default handle table.
pub const DEFAULT_MAX_CLASS_SHIFT: u32 = 28;

impl StateInfo {
  /// Builds the default handle table: powers of two from `1` to `2^28`,
  /// each with [`DEFAULT_BLOCK_SIZE`] and alignment equal to its slot size.
  pub fn default_table() -> StateInfo {
    let handles = (0..=DEFAULT_MAX_CLASS_SHIFT)
      .map(|shift| {
        let size = 1usize << shift;
        HandleInfo { alloc_size: size, block_size: DEFAULT_BLOCK_SIZE, alignment: size }
      })
      .collect();
    StateInfo { handles, index_fn: None }
  }
}

/// A table of handles plus the dispatch function used to pick one. See
/// the module documentation.
pub struct State {
  handles: Vec<Handle>,
  index_fn: IndexFn,
}

impl State {
  pub fn new(info: Option<StateInfo>) -> Arc<State> {
    let info = info.unwrap_or_else(StateInfo::default_table);
    let mut handles: Vec<Handle> = info.handles.iter().map(|h| Handle::new(Some(*h))).collect();
    handles.push(Handle::new(None));
    Arc::new(State { handles, index_fn: info.index_fn.unwrap_or(default_index) })
  }

  /// Number of caller-specified handles, not counting the trailing
  /// virtual handle.
  pub fn handle_count(&self) -> usize {
    self.handles.len() - 1
  }

  /// Returns the handle responsible for `size`. Always returns a valid
  /// handle: indices past the table clamp to the trailing virtual handle.
  pub fn handle_for(&self, size: usize) -> &Handle {
    let index = (self.index_fn)(size).min(self.handles.len() - 1);
    &self.handles[index]
  }

  /// Allocates `size` bytes from the handle `size` dispatches to.
  pub fn alloc(&self, size: usize, zero: bool) -> *mut u8 {
    if size == 0 {
      return std::ptr::null_mut();
    }
    self.handle_for(size).alloc(size, zero)
  }

  /// Frees a pointer previously returned by [`State::alloc`] with the
  /// same `size`.
  pub fn free(&self, ptr: *mut u8, size: usize) {
    if ptr.is_null() || size == 0 {
      return;
    }
    self.handle_for(size).free(ptr, size);
  }

  /// Reallocates from `old_size`'s handle (in `self`) to `new_size`'s
  /// handle (in `new_state`).
  pub fn realloc(&self, ptr: *mut u8, old_size: usize, new_state: &State, new_size: usize, zero: bool) -> *mut u8 {
    let old_handle = self.handle_for(old_size);
    let new_handle = new_state.handle_for(new_size);
    Handle::realloc(old_handle, ptr, old_size, new_handle, new_size, zero)
  }

  /// Duplicates the table's shape (same dispatch function, same
  /// per-handle slot/block sizing) with every handle reset to zero
  /// allocators/allocations. Does not duplicate live blocks.
  pub fn clone_state(source: &State) -> Arc<State> {
    let handles = source.handles.iter().map(Handle::clone_handle).collect();
    Arc::new(State { handles, index_fn: source.index_fn })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_index_matches_ceil_log2() {
    assert_eq!(default_index(1), 0);
    assert_eq!(default_index(2), 1);
    assert_eq!(default_index(3), 2);
    assert_eq!(default_index(4), 2);
    assert_eq!(default_index(5), 3);
    assert_eq!(default_index(1 << 20), 20);
  }

  #[test]
  fn oversized_requests_dispatch_to_the_virtual_handle() {
    let state = State::new(Some(StateInfo { handles: vec![HandleInfo { alloc_size: 64, block_size: 4096, alignment: 8 }], index_fn: None }));
    assert_eq!(state.handle_count(), 1);
    let huge = state.handle_for(1 << 30);
    assert!(huge.is_virtual());
  }

  #[test]
  fn small_requests_round_trip_through_their_handle() {
    let state = State::new(Some(StateInfo {
      handles: vec![
        HandleInfo { alloc_size: 16, block_size: 4096, alignment: 8 },
        HandleInfo { alloc_size: 64, block_size: 4096, alignment: 8 },
      ],
      index_fn: Some(|size| if size <= 16 { 0 } else { 1 }),
    }));
    let p = state.alloc(10, true);
    assert!(!p.is_null());
    state.free(p, 10);
  }
}

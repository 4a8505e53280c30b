//! # blockalloc - A size-classed, multithreaded slab allocator
//!
//! This crate splits allocation requests across many independent,
//! size-specialized sub-allocators (called *handles*), each of which
//! carves fixed-size *slots* out of large, page-aligned *blocks* obtained
//! directly from the operating system. There is no per-allocation header:
//! given any live pointer, its owning block is recovered in O(1) by
//! masking off the low bits of the pointer.
//!
//! ```text
//!   State
//!   ┌──────────────────────────────────────────────────────────┐
//!   │ handle[0]  handle[1]  handle[2]  ...  handle[H-1] virtual │
//!   │  (1 B)      (2 B)      (4 B)           (2^(H-1) B)  (any) │
//!   └──────────────────────────────────────────────────────────┘
//!             │
//!             ▼
//!   Handle (one size class)
//!   ┌───────────────────────────────────────────┐
//!   │ lock | slot_size | block_size | not-full  │──► Block ──► Block ──► …
//!   │      | flags     | padding    | list head │
//!   └───────────────────────────────────────────┘
//!
//!   Block (page-aligned, block_size-aligned)
//!   ┌────────┬─────────────────────────────────────────────────┐
//!   │ header │ slot │ slot │ slot │ ... │ slot                  │
//!   └────────┴─────────────────────────────────────────────────┘
//!            ▲
//!            block_base + padding
//! ```
//!
//! ## Crate structure
//!
//! ```text
//!   blockalloc
//!   ├── align    - alignment macros and helpers
//!   ├── facade   - virtual memory façade (mmap/VirtualAlloc)
//!   ├── variant  - block sub-allocator algorithms (1/2/4-byte index width)
//!   ├── handle   - Handle: one size class, lock + flags + dispatch to a variant
//!   └── state    - State: a table of handles plus size→handle dispatch
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use blockalloc::{alloc, free, State, StateInfo};
//!
//! let state = State::new(None); // the default power-of-two table
//! let ptr = state.alloc(128, true);
//! unsafe {
//!     *(ptr as *mut u32) = 42;
//! }
//! state.free(ptr, 128);
//! ```
//!
//! Or, via the process-wide default state (enabled by the `global-state`
//! feature, on by default):
//!
//! ```rust,ignore
//! use blockalloc::{malloc, free_default};
//!
//! let ptr = malloc(128);
//! free_default(ptr, 128);
//! ```
//!
//! ## Failure model
//!
//! There is no `Result`-returning entry point. Out-of-memory and
//! zero-size requests both surface as a null pointer (the latter is not
//! an error — it is simply a no-op). Contract violations (double-free,
//! mismatched size, calling an unlocked variant without holding the
//! handle's lock) are undefined behavior: debug builds catch them with
//! `debug_assert!`, release builds do not check. This mirrors the
//! hardened/empty assertion split of the C library this crate's design
//! is descended from.
//!
//! ## Concurrency
//!
//! Each handle is guarded by its own [`parking_lot::Mutex`]; handles for
//! different size classes never contend with one another. Use
//! [`Handle::external_lock`] / [`Handle::external_unlock`] (or the
//! `_u`-suffixed methods) to batch several operations on one handle
//! under a single lock acquisition.

pub mod align;
pub(crate) mod facade;
pub mod handle;
pub mod state;
pub(crate) mod variant;

pub use handle::{Handle, HandleFlags, HandleInfo};
pub use state::{default_index, IndexFn, State, StateInfo};

use std::ptr::addr_of_mut;
use std::sync::Arc;
use std::sync::Once;

#[cfg(feature = "global-state")]
use ctor::{ctor, dtor};

static GLOBAL_STATE_INIT: Once = Once::new();
static mut GLOBAL_STATE: Option<Arc<State>> = None;

/// Returns the process-wide default state, constructing it on first use
/// if the `global-state` feature's constructor hook has not already done
/// so (e.g. because it was disabled).
pub fn global_state() -> &'static Arc<State> {
  GLOBAL_STATE_INIT.call_once(|| unsafe {
    *addr_of_mut!(GLOBAL_STATE) = Some(State::new(None));
  });
  // Safety: `GLOBAL_STATE` is only ever written from `call_once` above
  // (happens-before every reader) and from `drop_global_state` below,
  // which by contract runs after the process stops calling into this
  // crate.
  unsafe { (*addr_of_mut!(GLOBAL_STATE)).as_ref().expect("GLOBAL_STATE_INIT.call_once sets GLOBAL_STATE") }
}

#[cfg(feature = "global-state")]
#[ctor]
fn init_global_state() {
  let _ = global_state();
}

#[cfg(feature = "global-state")]
#[dtor]
fn drop_global_state() {
  // Safety: destructors run once at library unload, after which no
  // other thread may call back into this crate, so this plain write
  // cannot race with `global_state()`. Replacing the `Option` with
  // `None` drops the `Arc`; if this was the last strong reference, every
  // handle's `Drop` impl runs here, releasing any block each handle
  // still had cached before the process unloads the library.
  unsafe {
    *addr_of_mut!(GLOBAL_STATE) = None;
  }
}

/// Returns the handle that `size` dispatches to in the global state.
pub fn get_handle(size: usize) -> &'static Handle {
  global_state().handle_for(size)
}

/// Allocates `size` bytes from the global state, optionally zeroed.
pub fn alloc(size: usize, zero: bool) -> *mut u8 {
  global_state().alloc(size, zero)
}

/// Frees a pointer previously returned by [`alloc`] (or any of the
/// `malloc`/`calloc`/`remalloc`/`recalloc` wrappers) with the same size.
pub fn free_default(ptr: *mut u8, size: usize) {
  global_state().free(ptr, size);
}

/// Reallocates within the global state.
pub fn realloc(ptr: *mut u8, old_size: usize, new_size: usize, zero: bool) -> *mut u8 {
  let state = global_state();
  state.realloc(ptr, old_size, state, new_size, zero)
}

/// `alloc(size, false)`.
pub fn malloc(size: usize) -> *mut u8 {
  alloc(size, false)
}

/// `alloc(size, true)`.
pub fn calloc(size: usize) -> *mut u8 {
  alloc(size, true)
}

/// `realloc(ptr, old_size, new_size, false)`.
pub fn remalloc(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
  realloc(ptr, old_size, new_size, false)
}

/// `realloc(ptr, old_size, new_size, true)`.
pub fn recalloc(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
  realloc(ptr, old_size, new_size, true)
}

/// Allocates directly from the operating system, bypassing every handle.
/// Every call must be paired with [`free_virtual`].
pub fn alloc_virtual(size: usize) -> *mut u8 {
  facade::alloc(size)
}

/// Frees memory obtained from [`alloc_virtual`].
pub fn free_virtual(ptr: *mut u8, size: usize) {
  facade::free(ptr, size);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn global_state_serves_allocations() {
    let p = malloc(128);
    assert!(!p.is_null());
    unsafe {
      *(p as *mut u32) = 0xDEAD_BEEF;
      assert_eq!(*(p as *mut u32), 0xDEAD_BEEF);
    }
    free_default(p, 128);
  }

  #[test]
  fn calloc_zeroes_memory() {
    let p = calloc(256);
    assert!(!p.is_null());
    unsafe {
      for i in 0..256 {
        assert_eq!(*p.add(i), 0);
      }
    }
    free_default(p, 256);
  }

  #[test]
  fn remalloc_preserves_contents() {
    let p = malloc(32);
    unsafe {
      std::ptr::write_bytes(p, 0x5A, 32);
    }
    let p2 = remalloc(p, 32, 512);
    assert!(!p2.is_null());
    unsafe {
      assert_eq!(*p2, 0x5A);
    }
    free_default(p2, 512);
  }

  #[test]
  fn virtual_alloc_round_trip() {
    let p = alloc_virtual(4096);
    assert!(!p.is_null());
    free_virtual(p, 4096);
  }
}

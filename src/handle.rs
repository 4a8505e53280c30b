//! Allocator handles: one per size class.
//!
//! A [`Handle`] owns everything needed to allocate and free objects of a
//! single size: the variant it dispatches to, the block/slot layout
//! constants computed at construction, per-handle flags, and the lock
//! guarding its mutable accounting. Handles are independent of one
//! another — allocating from two different handles concurrently never
//! contends on the same lock.

use parking_lot::{Mutex, MutexGuard};
use std::ptr;

use crate::facade;
use crate::variant::{self, Accounting, Kind, Layout, ALLOC1_MAX, BLOCK1_MAX, BLOCK2_MAX, BLOCK4_MAX, MEDIUM_SLOT_LIMIT_MAX, WIDE_SLOT_LIMIT_MAX};

/// Handle behavior flags. `IMMEDIATE_FREE` takes precedence over
/// `DO_NOT_FREE` when both are set.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct HandleFlags(u8);

impl HandleFlags {
  pub const NONE: HandleFlags = HandleFlags(0);
  pub const IMMEDIATE_FREE: HandleFlags = HandleFlags(1 << 0);
  pub const DO_NOT_FREE: HandleFlags = HandleFlags(1 << 1);

  pub const fn bits(self) -> u8 {
    self.0
  }

  pub const fn contains(self, other: HandleFlags) -> bool {
    self.0 & other.0 == other.0
  }

  pub const fn union(self, other: HandleFlags) -> HandleFlags {
    HandleFlags(self.0 | other.0)
  }

  pub const fn difference(self, other: HandleFlags) -> HandleFlags {
    HandleFlags(self.0 & !other.0)
  }
}

impl std::ops::BitOr for HandleFlags {
  type Output = HandleFlags;
  fn bitor(self, rhs: HandleFlags) -> HandleFlags {
    self.union(rhs)
  }
}

/// Initialization parameters for [`Handle::new`]. `None` creates a
/// *virtual* handle: every request forwards straight to the façade, with
/// the slot pointer equal to the block pointer.
#[derive(Clone, Copy)]
pub struct HandleInfo {
  pub alloc_size: usize,
  pub block_size: usize,
  pub alignment: usize,
}

struct Inner {
  accounting: Accounting,
  flags: HandleFlags,
}

/// A size-class sub-allocator. See the module documentation.
pub struct Handle {
  inner: Mutex<Inner>,
  layout: Option<Layout>,
}

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
  /// Creates a handle from `info`, or a virtual handle if `info` is `None`.
  pub fn new(info: Option<HandleInfo>) -> Handle {
    let layout = info.map(|info| Self::resolve_layout(info));
    Handle { inner: Mutex::new(Inner { accounting: Accounting::new(), flags: HandleFlags::NONE }), layout }
  }

  /// Whether this handle forwards directly to the façade instead of
  /// sub-allocating from blocks.
  pub fn is_virtual(&self) -> bool {
    self.layout.is_none()
  }

  /// The slot size this handle allocates, or 0 for a virtual handle.
  pub fn slot_size(&self) -> usize {
    self.layout.map(|l| l.slot_size).unwrap_or(0)
  }

  fn resolve_layout(info: HandleInfo) -> Layout {
    assert!(info.alloc_size > 0, "handle alloc size must be nonzero");

    let page_size = facade::page_size();
    let alignment = info.alignment.max(1).next_power_of_two();

    if info.alloc_size == 1 {
      let block_size = crate::align::next_power_of_two(info.block_size.clamp(page_size, BLOCK1_MAX));
      let sub_blocks = variant::narrow_sub_blocks_for(block_size).max(1);
      let slot_limit = sub_blocks * ALLOC1_MAX;
      return Layout { kind: Kind::Narrow, slot_size: 1, block_size, padding: 0, slot_limit, sub_blocks };
    }

    let kind = if info.alloc_size == 2 { Kind::Medium } else { Kind::Wide };
    let (header_size, max_block, max_slot_limit): (usize, usize, usize) = match kind {
      Kind::Medium => (std::mem::size_of::<FlatHeaderProbe<u16>>(), BLOCK2_MAX, MEDIUM_SLOT_LIMIT_MAX),
      Kind::Wide => (std::mem::size_of::<FlatHeaderProbe<u32>>(), BLOCK4_MAX, WIDE_SLOT_LIMIT_MAX),
      Kind::Narrow => unreachable!(),
    };

    let padding = crate::align::align_up(header_size, alignment);
    let block_size_hint = info.block_size.clamp(page_size, max_block);
    let mut block_size = crate::align::next_power_of_two(block_size_hint).min(max_block.next_power_of_two());
    loop {
      let slot_limit = ((block_size - padding) / info.alloc_size).min(max_slot_limit);
      if slot_limit >= 1 || block_size >= max_block {
        return Layout { kind, slot_size: info.alloc_size, block_size, padding, slot_limit: slot_limit.max(1), sub_blocks: 0 };
      }
      block_size *= 2;
    }
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock()
  }

  /// Acquires the handle's lock for a batch of `_u` (already-locked)
  /// operations. Not reentrant: locking a handle already locked by the
  /// same thread deadlocks, matching the upstream contract.
  pub fn external_lock(&self) {
    std::mem::forget(self.inner.lock());
  }

  /// Releases a lock taken with [`Handle::external_lock`].
  ///
  /// # Safety
  /// Must be paired 1:1 with a prior `external_lock` call on this handle.
  pub unsafe fn external_unlock(&self) {
    self.inner.force_unlock();
  }

  pub fn flags(&self) -> HandleFlags {
    self.lock().flags
  }

  /// Same as [`Handle::flags`], assuming the caller already holds the
  /// handle's lock via [`Handle::external_lock`].
  ///
  /// # Safety
  /// The handle must currently be locked by the calling thread.
  pub unsafe fn flags_unlocked(&self) -> HandleFlags {
    self.inner.data_ptr().as_ref().unwrap().flags
  }

  pub fn set_flags(&self, flags: HandleFlags) {
    self.lock().flags = flags;
  }

  /// Same as [`Handle::set_flags`], assuming the caller already holds the
  /// handle's lock via [`Handle::external_lock`].
  ///
  /// # Safety
  /// The handle must currently be locked by the calling thread.
  pub unsafe fn set_flags_unlocked(&self, flags: HandleFlags) {
    (*self.inner.data_ptr()).flags = flags;
  }

  pub fn add_flags(&self, flags: HandleFlags) {
    let mut inner = self.lock();
    inner.flags = inner.flags.union(flags);
  }

  /// Same as [`Handle::add_flags`], assuming the caller already holds the
  /// handle's lock via [`Handle::external_lock`].
  ///
  /// # Safety
  /// The handle must currently be locked by the calling thread.
  pub unsafe fn add_flags_unlocked(&self, flags: HandleFlags) {
    let inner = &mut *self.inner.data_ptr();
    inner.flags = inner.flags.union(flags);
  }

  pub fn del_flags(&self, flags: HandleFlags) {
    let mut inner = self.lock();
    inner.flags = inner.flags.difference(flags);
  }

  /// Same as [`Handle::del_flags`], assuming the caller already holds the
  /// handle's lock via [`Handle::external_lock`].
  ///
  /// # Safety
  /// The handle must currently be locked by the calling thread.
  pub unsafe fn del_flags_unlocked(&self, flags: HandleFlags) {
    let inner = &mut *self.inner.data_ptr();
    inner.flags = inner.flags.difference(flags);
  }

  /// Allocates `size` bytes. `size` must be `<= slot_size` for a
  /// non-virtual handle. Returns null on failure or when `size == 0`.
  pub fn alloc(&self, size: usize, zero: bool) -> *mut u8 {
    if size == 0 {
      return ptr::null_mut();
    }
    let mut inner = self.lock();
    unsafe { self.alloc_locked(&mut inner, size, zero) }
  }

  /// Same as [`Handle::alloc`], assuming the caller already holds the
  /// handle's lock via [`Handle::external_lock`].
  ///
  /// # Safety
  /// The handle must currently be locked by the calling thread.
  pub unsafe fn alloc_u(&self, size: usize, zero: bool) -> *mut u8 {
    if size == 0 {
      return ptr::null_mut();
    }
    let inner = &mut *self.inner.data_ptr();
    self.alloc_locked(inner, size, zero)
  }

  unsafe fn alloc_locked(&self, inner: &mut Inner, size: usize, zero: bool) -> *mut u8 {
    let Some(layout) = self.layout else {
      let p = facade::alloc(size);
      if !p.is_null() {
        inner.accounting.allocations += 1;
      }
      return p;
    };

    debug_assert!(size <= layout.slot_size, "requested size exceeds handle's slot size");
    match layout.kind {
      Kind::Narrow => variant::narrow_allocate(&mut inner.accounting, &layout, zero),
      Kind::Medium => variant::flat_allocate::<u16>(&mut inner.accounting, &layout, zero),
      Kind::Wide => variant::flat_allocate::<u32>(&mut inner.accounting, &layout, zero),
    }
  }

  /// Frees a pointer previously returned by [`Handle::alloc`] on this
  /// handle. `size` must match the size used to allocate it.
  pub fn free(&self, ptr: *mut u8, size: usize) {
    if ptr.is_null() {
      return;
    }
    let mut inner = self.lock();
    unsafe { self.free_locked(&mut inner, ptr, size) }
  }

  /// # Safety
  /// The handle must currently be locked by the calling thread.
  pub unsafe fn free_u(&self, ptr: *mut u8, size: usize) {
    if ptr.is_null() {
      return;
    }
    let inner = &mut *self.inner.data_ptr();
    self.free_locked(inner, ptr, size)
  }

  unsafe fn free_locked(&self, inner: &mut Inner, ptr: *mut u8, size: usize) {
    let Some(layout) = self.layout else {
      inner.accounting.allocations -= 1;
      facade::free(ptr, size);
      return;
    };

    let immediate_free = inner.flags.contains(HandleFlags::IMMEDIATE_FREE);
    let do_not_free = inner.flags.contains(HandleFlags::DO_NOT_FREE);
    match layout.kind {
      Kind::Narrow => variant::narrow_free(&mut inner.accounting, &layout, immediate_free, do_not_free, ptr),
      Kind::Medium => variant::flat_free::<u16>(&mut inner.accounting, &layout, immediate_free, do_not_free, ptr),
      Kind::Wide => variant::flat_free::<u32>(&mut inner.accounting, &layout, immediate_free, do_not_free, ptr),
    }
  }

  /// Reallocates from `old_handle` to `new_handle`. If both are the same
  /// non-virtual handle, this is a no-op beyond zero-filling newly
  /// exposed bytes: the slot already accommodates the new size.
  pub fn realloc(old_handle: &Handle, ptr: *mut u8, old_size: usize, new_handle: &Handle, new_size: usize, zero: bool) -> *mut u8 {
    if new_size == 0 {
      old_handle.free(ptr, old_size);
      return ptr::null_mut();
    }
    if ptr.is_null() || old_size == 0 {
      return new_handle.alloc(new_size, zero);
    }

    if std::ptr::eq(old_handle, new_handle) && !old_handle.is_virtual() {
      if zero && new_size > old_size {
        unsafe {
          ptr::write_bytes(ptr.add(old_size), 0, new_size - old_size);
        }
      }
      return ptr;
    }

    let new_ptr = new_handle.alloc(new_size, false);
    if new_ptr.is_null() {
      return ptr::null_mut();
    }
    let copy_len = old_size.min(new_size);
    unsafe {
      ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
      if zero && new_size > copy_len {
        ptr::write_bytes(new_ptr.add(copy_len), 0, new_size - copy_len);
      }
    }
    old_handle.free(ptr, old_size);
    new_ptr
  }

  /// Creates a fresh, empty handle with the same slot/block sizing as
  /// `source`. Does not share or copy `source`'s live blocks.
  pub fn clone_handle(source: &Handle) -> Handle {
    Handle { inner: Mutex::new(Inner { accounting: Accounting::new(), flags: HandleFlags::NONE }), layout: source.layout }
  }
}

impl Drop for Handle {
  fn drop(&mut self) {
    let inner = self.inner.get_mut();
    if let Some(layout) = self.layout {
      if !inner.accounting.head.is_null() {
        unsafe {
          let real_ptr = match layout.kind {
            Kind::Narrow => (*(inner.accounting.head as *mut NarrowBlockProbe)).real_ptr,
            Kind::Medium | Kind::Wide => (*(inner.accounting.head as *mut FlatHeaderProbe<u32>)).real_ptr,
          };
          facade::free_aligned(real_ptr, layout.block_size, layout.block_size);
        }
      }
    }
  }
}

// Field-compatible probes used only to read `real_ptr` out of a block
// during `Drop`, without exposing the variant module's private block
// structs outside of it.
#[repr(C)]
struct FlatHeaderProbe<T> {
  _prev: *mut u8,
  _next: *mut u8,
  real_ptr: *mut u8,
  _count: u32,
  _used: u32,
  _free_head: T,
}

#[repr(C)]
struct NarrowBlockProbe {
  _prev: *mut u8,
  _next: *mut u8,
  real_ptr: *mut u8,
  _free_sub: u32,
  _count: u32,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn virtual_handle_forwards_to_the_facade() {
    let h = Handle::new(None);
    assert!(h.is_virtual());
    let p = h.alloc(4096, false);
    assert!(!p.is_null());
    h.free(p, 4096);
  }

  #[test]
  fn narrow_handle_allocates_one_byte_slots() {
    let h = Handle::new(Some(HandleInfo { alloc_size: 1, block_size: 4096, alignment: 1 }));
    let mut ptrs = Vec::new();
    for _ in 0..300 {
      let p = h.alloc(1, false);
      assert!(!p.is_null());
      ptrs.push(p);
    }
    for p in ptrs {
      h.free(p, 1);
    }
  }

  #[test]
  fn medium_handle_round_trips_many_allocations() {
    let h = Handle::new(Some(HandleInfo { alloc_size: 64, block_size: 8192, alignment: 8 }));
    let mut ptrs = Vec::new();
    for i in 0..500 {
      let p = h.alloc(64, i % 2 == 0);
      assert!(!p.is_null());
      ptrs.push(p);
    }
    for p in ptrs {
      h.free(p, 64);
    }
  }

  #[test]
  fn realloc_in_place_zero_fills_new_tail() {
    let h = Handle::new(Some(HandleInfo { alloc_size: 256, block_size: 8192, alignment: 8 }));
    let p = h.alloc(16, false);
    unsafe {
      ptr::write_bytes(p, 0x11, 16);
    }
    let p2 = Handle::realloc(&h, p, 16, &h, 200, true);
    assert_eq!(p, p2);
    unsafe {
      assert_eq!(*p2, 0x11);
      assert_eq!(*p2.add(199), 0);
    }
    h.free(p2, 200);
  }

  #[test]
  fn immediate_free_releases_block_every_time_it_empties() {
    let h = Handle::new(Some(HandleInfo { alloc_size: 32, block_size: 4096, alignment: 8 }));
    h.set_flags(HandleFlags::IMMEDIATE_FREE);
    for _ in 0..10 {
      let p = h.alloc(32, false);
      h.free(p, 32);
    }
  }

  #[test]
  fn do_not_free_keeps_blocks_cached() {
    let h = Handle::new(Some(HandleInfo { alloc_size: 32, block_size: 4096, alignment: 8 }));
    h.set_flags(HandleFlags::DO_NOT_FREE);
    let mut ptrs = Vec::new();
    for _ in 0..200 {
      ptrs.push(h.alloc(32, false));
    }
    for p in ptrs {
      h.free(p, 32);
    }
  }
}

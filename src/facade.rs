//! Virtual memory façade.
//!
//! Every block the allocator hands out to a handle is backed by memory
//! obtained here, directly from the operating system. This module knows
//! nothing about slots, handles, or size classes — it only reserves,
//! commits, and releases page-aligned (or arbitrarily-aligned) ranges.
//!
//! ```text
//!   alloc_aligned(size, align):
//!
//!   ┌─────────────────────────────────────────────────────────┐
//!   │ reserved range (size + align - 1), PROT_NONE / NOACCESS  │
//!   │        ┌───────────────────────────────────┐            │
//!   │        │   committed, aligned sub-range     │            │
//!   │        │       (returned to the caller)     │            │
//!   │        └───────────────────────────────────┘            │
//!   └─────────────────────────────────────────────────────────┘
//!   ▲
//!   real_ptr (passed back to free_aligned)
//! ```

use std::ptr;
use std::sync::OnceLock;

/// Returns the system's page size, queried once and cached for the life
/// of the process.
///
/// Panics if the platform reports a page size that is not a nonzero power
/// of two: that is not a failure this library's narrow allocation-failure
/// taxonomy covers, it is a broken platform assumption.
pub fn page_size() -> usize {
  static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
  *PAGE_SIZE.get_or_init(|| {
    let size = os::query_page_size();
    assert!(
      size > 0 && size.is_power_of_two(),
      "platform reported a page size of {size}, which is not a power of two"
    );
    size
  })
}

/// Allocates `size` bytes of zeroed virtual memory. Returns a null pointer
/// on failure or when `size == 0`.
pub fn alloc(size: usize) -> *mut u8 {
  if size == 0 {
    return ptr::null_mut();
  }
  unsafe { os::alloc(size) }
}

/// Frees memory previously returned by [`alloc`]. `size` must match the
/// size passed to the allocating call. A no-op for a null pointer or a
/// zero size.
pub fn free(ptr: *mut u8, size: usize) {
  if ptr.is_null() || size == 0 {
    return;
  }
  unsafe { os::free(ptr, size) }
}

/// Allocates `size` bytes aligned to `alignment` (a power of two).
///
/// Returns `(real_ptr, aligned_ptr)`. `real_ptr` is the reservation that
/// must be passed back to [`free_aligned`]; `aligned_ptr` is the usable
/// range. On failure (or `size == 0`) both are null.
pub fn alloc_aligned(size: usize, alignment: usize) -> (*mut u8, *mut u8) {
  if size == 0 {
    return (ptr::null_mut(), ptr::null_mut());
  }
  debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
  unsafe { os::alloc_aligned(size, alignment) }
}

/// Frees memory previously returned by [`alloc_aligned`]. `size` and
/// `alignment` must match the allocating call. `real_ptr` is the first
/// element of the pair returned by `alloc_aligned`, not the second.
pub fn free_aligned(real_ptr: *mut u8, size: usize, alignment: usize) {
  if real_ptr.is_null() || size == 0 {
    return;
  }
  unsafe { os::free_aligned(real_ptr, size, alignment) }
}

/// Reallocates an unaligned range obtained from [`alloc`]. Copies
/// `min(old_size, new_size)` bytes. Returns null on failure, leaving the
/// old allocation untouched.
pub fn realloc(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
  if new_size == 0 {
    free(ptr, old_size);
    return ptr::null_mut();
  }
  if ptr.is_null() || old_size == 0 {
    return alloc(new_size);
  }
  unsafe { os::realloc(ptr, old_size, new_size) }
}

/// Reallocates an aligned range obtained from [`alloc_aligned`]. Always
/// allocates fresh and copies; there is no in-place aligned growth path.
pub fn realloc_aligned(
  real_ptr: *mut u8,
  old_size: usize,
  new_size: usize,
  alignment: usize,
) -> (*mut u8, *mut u8) {
  let (new_real, new_aligned) = alloc_aligned(new_size, alignment);
  if new_aligned.is_null() {
    return (ptr::null_mut(), ptr::null_mut());
  }
  if !real_ptr.is_null() && old_size > 0 {
    let copy_len = old_size.min(new_size);
    unsafe {
      ptr::copy_nonoverlapping(real_ptr, new_aligned, copy_len);
    }
    free_aligned(real_ptr, old_size, alignment);
  }
  (new_real, new_aligned)
}

#[cfg(unix)]
mod os {
  use super::*;
  use libc::{c_void, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE, PROT_READ, PROT_WRITE};
  use log::warn;

  pub fn query_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
      0
    } else {
      size as usize
    }
  }

  pub unsafe fn alloc(size: usize) -> *mut u8 {
    let out = libc::mmap(
      ptr::null_mut(),
      size,
      PROT_READ | PROT_WRITE,
      MAP_PRIVATE | MAP_ANON,
      -1,
      0,
    );
    if out == MAP_FAILED {
      warn!("mmap failed for size {size}: {}", std::io::Error::last_os_error());
      return ptr::null_mut();
    }
    out as *mut u8
  }

  pub unsafe fn free(ptr: *mut u8, size: usize) {
    if libc::munmap(ptr as *mut c_void, size) != 0 {
      warn!(
        "munmap failed for {ptr:p}, size {size}: {}",
        std::io::Error::last_os_error()
      );
    }
  }

  pub unsafe fn alloc_aligned(size: usize, alignment: usize) -> (*mut u8, *mut u8) {
    let reserve_size = size + alignment - 1;
    let base = libc::mmap(
      ptr::null_mut(),
      reserve_size,
      PROT_NONE,
      MAP_PRIVATE | MAP_ANON,
      -1,
      0,
    );
    if base == MAP_FAILED {
      warn!(
        "mmap reservation failed for size {reserve_size}: {}",
        std::io::Error::last_os_error()
      );
      return (ptr::null_mut(), ptr::null_mut());
    }
    let base = base as *mut u8;
    let aligned = crate::align::align_up_ptr(base, alignment);
    if libc::mprotect(aligned as *mut c_void, size, PROT_READ | PROT_WRITE) != 0 {
      warn!(
        "mprotect failed for {aligned:p}, size {size}: {}",
        std::io::Error::last_os_error()
      );
      libc::munmap(base as *mut c_void, reserve_size);
      return (ptr::null_mut(), ptr::null_mut());
    }
    (base, aligned)
  }

  pub unsafe fn free_aligned(real_ptr: *mut u8, size: usize, alignment: usize) {
    let reserve_size = size + alignment - 1;
    free(real_ptr, reserve_size);
  }

  #[cfg(target_os = "linux")]
  pub unsafe fn realloc(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    let out = libc::mremap(ptr as *mut c_void, old_size, new_size, libc::MREMAP_MAYMOVE);
    if out == MAP_FAILED {
      warn!(
        "mremap failed for {ptr:p}, {old_size} -> {new_size}: {}",
        std::io::Error::last_os_error()
      );
      return ptr::null_mut();
    }
    out as *mut u8
  }

  #[cfg(not(target_os = "linux"))]
  pub unsafe fn realloc(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    let fresh = alloc(new_size);
    if fresh.is_null() {
      return ptr::null_mut();
    }
    let copy_len = old_size.min(new_size);
    ptr::copy_nonoverlapping(ptr, fresh, copy_len);
    free(ptr, old_size);
    fresh
  }
}

#[cfg(windows)]
mod os {
  use super::*;
  use log::warn;
  use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
  use winapi::um::sysinfoapi::GetSystemInfo;
  use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

  pub fn query_page_size() -> usize {
    unsafe {
      let mut info = std::mem::zeroed();
      GetSystemInfo(&mut info);
      info.dwPageSize as usize
    }
  }

  pub unsafe fn alloc(size: usize) -> *mut u8 {
    let out = VirtualAlloc(
      ptr::null_mut(),
      size,
      MEM_RESERVE | MEM_COMMIT,
      PAGE_READWRITE,
    );
    if out.is_null() {
      warn!("VirtualAlloc failed for size {size}: {}", std::io::Error::last_os_error());
    }
    out as *mut u8
  }

  pub unsafe fn free(ptr: *mut u8, _size: usize) {
    if VirtualFree(ptr as *mut _, 0, MEM_RELEASE) == 0 {
      warn!("VirtualFree failed for {ptr:p}: {}", std::io::Error::last_os_error());
    }
  }

  pub unsafe fn alloc_aligned(size: usize, alignment: usize) -> (*mut u8, *mut u8) {
    let reserve_size = size + alignment - 1;
    let base = VirtualAlloc(ptr::null_mut(), reserve_size, MEM_RESERVE, PAGE_NOACCESS);
    if base.is_null() {
      warn!(
        "VirtualAlloc reservation failed for size {reserve_size}: {}",
        std::io::Error::last_os_error()
      );
      return (ptr::null_mut(), ptr::null_mut());
    }
    let base = base as *mut u8;
    let aligned = crate::align::align_up_ptr(base, alignment);
    let committed = VirtualAlloc(aligned as *mut _, size, MEM_COMMIT, PAGE_READWRITE);
    if committed.is_null() {
      warn!(
        "VirtualAlloc commit failed for {aligned:p}, size {size}: {}",
        std::io::Error::last_os_error()
      );
      VirtualFree(base as *mut _, 0, MEM_RELEASE);
      return (ptr::null_mut(), ptr::null_mut());
    }
    (base, aligned)
  }

  pub unsafe fn free_aligned(real_ptr: *mut u8, _size: usize, _alignment: usize) {
    if VirtualFree(real_ptr as *mut _, 0, MEM_RELEASE) == 0 {
      warn!("VirtualFree failed for {real_ptr:p}: {}", std::io::Error::last_os_error());
    }
  }

  pub unsafe fn realloc(ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    let fresh = alloc(new_size);
    if fresh.is_null() {
      return std::ptr::null_mut();
    }
    let copy_len = old_size.min(new_size);
    std::ptr::copy_nonoverlapping(ptr, fresh, copy_len);
    free(ptr, old_size);
    fresh
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_size_is_a_power_of_two() {
    let size = page_size();
    assert!(size > 0);
    assert!(size.is_power_of_two());
  }

  #[test]
  fn zero_size_alloc_returns_null() {
    assert!(alloc(0).is_null());
    free_aligned(ptr::null_mut(), 0, 16);
  }

  #[test]
  fn alloc_free_round_trip() {
    let size = page_size();
    let p = alloc(size);
    assert!(!p.is_null());
    unsafe {
      std::ptr::write_bytes(p, 0xAB, size);
      assert_eq!(*p, 0xAB);
    }
    free(p, size);
  }

  #[test]
  fn alloc_aligned_honors_alignment() {
    let alignment = 64 * 1024;
    let size = page_size();
    let (real, aligned) = alloc_aligned(size, alignment);
    assert!(!real.is_null());
    assert!(!aligned.is_null());
    assert_eq!(aligned as usize % alignment, 0);
    unsafe {
      std::ptr::write_bytes(aligned, 0xCD, size);
    }
    free_aligned(real, size, alignment);
  }

  #[test]
  fn realloc_preserves_prefix() {
    let old_size = page_size();
    let new_size = old_size * 2;
    let p = alloc(old_size);
    unsafe {
      std::ptr::write_bytes(p, 0x7A, old_size);
    }
    let grown = realloc(p, old_size, new_size);
    assert!(!grown.is_null());
    unsafe {
      assert_eq!(*grown, 0x7A);
    }
    free(grown, new_size);
  }
}

//! Atomic views over shared memory.
//!
//! Log buffers and command rings are plain byte regions shared between a
//! client and the driver, possibly across processes. [`AtomicBuffer`] is the
//! only way the rest of the workspace touches them: every integer access is
//! an atomic operation on a naturally aligned address, and every access is
//! bounds checked.
//!
//! | access   | ordering  |
//! |----------|-----------|
//! | plain    | `Relaxed` |
//! | volatile | `Acquire` |
//! | ordered  | `Release` |
//! | CAS/add  | `AcqRel`  |

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

/// Memory that can back an [`AtomicBuffer`].
///
/// # Safety
///
/// `as_ptr` must return a pointer that is valid for reads and writes of
/// `len` bytes for as long as the region lives, aligned to at least 8 bytes.
/// The memory must only ever be accessed through shared references (no
/// `&mut` aliases), since many buffers may view it concurrently.
pub unsafe trait Region: Send + Sync + 'static {
    /// Base address of the region.
    fn as_ptr(&self) -> *mut u8;

    /// Length of the region in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Zeroed heap memory, 8-byte aligned.
pub struct HeapRegion {
    words: Box<[AtomicI64]>,
    len: usize,
}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(8)).map(|_| AtomicI64::new(0)).collect();
        Self { words, len }
    }
}

// SAFETY: the words are owned for the region's lifetime, `AtomicI64` gives
// 8-byte alignment and interior mutability for shared writes.
unsafe impl Region for HeapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// A bounds-checked window onto a [`Region`].
///
/// Cloning is cheap and yields another view of the same memory.
#[derive(Clone)]
pub struct AtomicBuffer {
    region: Arc<dyn Region>,
    offset: usize,
    len: usize,
}

impl AtomicBuffer {
    /// View the whole of `region`.
    pub fn new(region: Arc<dyn Region>) -> Self {
        let len = region.len();
        Self {
            region,
            offset: 0,
            len,
        }
    }

    /// Allocate a zeroed heap-backed buffer.
    pub fn allocate(len: usize) -> Self {
        Self::new(Arc::new(HeapRegion::new(len)))
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// A sub-view of `len` bytes starting at `index`.
    ///
    /// # Panics
    ///
    /// Panics if the range falls outside this buffer.
    pub fn view(&self, index: usize, len: usize) -> AtomicBuffer {
        self.bounds_check(index, len);
        Self {
            region: Arc::clone(&self.region),
            offset: self.offset + index,
            len,
        }
    }

    #[inline]
    fn bounds_check(&self, index: usize, len: usize) {
        let in_bounds = index.checked_add(len).is_some_and(|end| end <= self.len);
        assert!(
            in_bounds,
            "index {index} + length {len} out of bounds for buffer of {} bytes",
            self.len
        );
    }

    #[inline]
    fn ptr_at(&self, index: usize, len: usize) -> *mut u8 {
        self.bounds_check(index, len);
        // SAFETY: bounds checked above and the region is valid for `len()` bytes.
        unsafe { self.region.as_ptr().add(self.offset + index) }
    }

    #[inline]
    fn atomic_i32(&self, index: usize) -> &AtomicI32 {
        let ptr = self.ptr_at(index, 4);
        assert!(ptr as usize % 4 == 0, "unaligned i32 access at {index}");
        // SAFETY: in bounds, aligned, and the region only hands out shared access.
        unsafe { &*(ptr as *const AtomicI32) }
    }

    #[inline]
    fn atomic_i64(&self, index: usize) -> &AtomicI64 {
        let ptr = self.ptr_at(index, 8);
        assert!(ptr as usize % 8 == 0, "unaligned i64 access at {index}");
        // SAFETY: as for `atomic_i32`.
        unsafe { &*(ptr as *const AtomicI64) }
    }

    #[inline]
    fn atomic_u16(&self, index: usize) -> &AtomicU16 {
        let ptr = self.ptr_at(index, 2);
        assert!(ptr as usize % 2 == 0, "unaligned u16 access at {index}");
        // SAFETY: as for `atomic_i32`.
        unsafe { &*(ptr as *const AtomicU16) }
    }

    #[inline]
    fn atomic_u8(&self, index: usize) -> &AtomicU8 {
        let ptr = self.ptr_at(index, 1);
        // SAFETY: in bounds; bytes need no alignment.
        unsafe { &*(ptr as *const AtomicU8) }
    }

    #[inline]
    pub fn get_i32(&self, index: usize) -> i32 {
        self.atomic_i32(index).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn put_i32(&self, index: usize, value: i32) {
        self.atomic_i32(index).store(value, Ordering::Relaxed)
    }

    #[inline]
    pub fn get_i32_volatile(&self, index: usize) -> i32 {
        self.atomic_i32(index).load(Ordering::Acquire)
    }

    #[inline]
    pub fn put_i32_ordered(&self, index: usize, value: i32) {
        self.atomic_i32(index).store(value, Ordering::Release)
    }

    #[inline]
    pub fn compare_and_set_i32(&self, index: usize, expected: i32, update: i32) -> bool {
        self.atomic_i32(index)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn get_i64(&self, index: usize) -> i64 {
        self.atomic_i64(index).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn put_i64(&self, index: usize, value: i64) {
        self.atomic_i64(index).store(value, Ordering::Relaxed)
    }

    #[inline]
    pub fn get_i64_volatile(&self, index: usize) -> i64 {
        self.atomic_i64(index).load(Ordering::Acquire)
    }

    #[inline]
    pub fn put_i64_ordered(&self, index: usize, value: i64) {
        self.atomic_i64(index).store(value, Ordering::Release)
    }

    #[inline]
    pub fn compare_and_set_i64(&self, index: usize, expected: i64, update: i64) -> bool {
        self.atomic_i64(index)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Add `delta` and return the previous value.
    #[inline]
    pub fn get_and_add_i64(&self, index: usize, delta: i64) -> i64 {
        self.atomic_i64(index).fetch_add(delta, Ordering::AcqRel)
    }

    #[inline]
    pub fn get_u16(&self, index: usize) -> u16 {
        self.atomic_u16(index).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn put_u16(&self, index: usize, value: u16) {
        self.atomic_u16(index).store(value, Ordering::Relaxed)
    }

    #[inline]
    pub fn get_u8(&self, index: usize) -> u8 {
        self.atomic_u8(index).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn put_u8(&self, index: usize, value: u8) {
        self.atomic_u8(index).store(value, Ordering::Relaxed)
    }

    /// Copy `src` into the buffer at `index`.
    pub fn put_bytes(&self, index: usize, src: &[u8]) {
        let dst = self.ptr_at(index, src.len());
        // SAFETY: destination range is bounds checked and cannot overlap a
        // caller-owned slice.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) }
    }

    /// Copy bytes at `index` into `dst`.
    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) {
        let src = self.ptr_at(index, dst.len());
        // SAFETY: source range is bounds checked.
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) }
    }

    /// Copy `len` bytes at `index` into a new vector.
    pub fn to_vec(&self, index: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.get_bytes(index, &mut out);
        out
    }

    /// Fill `len` bytes at `index` with `value`.
    pub fn set_memory(&self, index: usize, len: usize, value: u8) {
        let dst = self.ptr_at(index, len);
        // SAFETY: range is bounds checked.
        unsafe { ptr::write_bytes(dst, value, len) }
    }
}

impl fmt::Debug for AtomicBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicBuffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_access() {
        let buffer = AtomicBuffer::allocate(64);
        buffer.put_i32(0, -7);
        buffer.put_i64_ordered(8, i64::MAX);
        buffer.put_u16(16, 0xBEEF);
        buffer.put_u8(18, 0x7F);

        assert_eq!(buffer.get_i32_volatile(0), -7);
        assert_eq!(buffer.get_i64(8), i64::MAX);
        assert_eq!(buffer.get_u16(16), 0xBEEF);
        assert_eq!(buffer.get_u8(18), 0x7F);
    }

    #[test]
    fn test_cas_and_add() {
        let buffer = AtomicBuffer::allocate(16);
        assert!(buffer.compare_and_set_i64(0, 0, 10));
        assert!(!buffer.compare_and_set_i64(0, 0, 20));
        assert_eq!(buffer.get_and_add_i64(0, 5), 10);
        assert_eq!(buffer.get_i64_volatile(0), 15);

        assert!(buffer.compare_and_set_i32(8, 0, 3));
        assert_eq!(buffer.get_i32(8), 3);
    }

    #[test]
    fn test_views_share_memory() {
        let buffer = AtomicBuffer::allocate(128);
        let view = buffer.view(64, 64);
        view.put_i64(0, 42);
        assert_eq!(buffer.get_i64(64), 42);
        assert_eq!(view.capacity(), 64);
    }

    #[test]
    fn test_bytes_round_trip() {
        let buffer = AtomicBuffer::allocate(32);
        buffer.put_bytes(3, b"hello");
        assert_eq!(buffer.to_vec(3, 5), b"hello");
        buffer.set_memory(3, 5, 0);
        assert_eq!(buffer.to_vec(3, 5), vec![0u8; 5]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds_panics() {
        let buffer = AtomicBuffer::allocate(16);
        buffer.get_i64(16);
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn test_unaligned_panics() {
        let buffer = AtomicBuffer::allocate(16);
        buffer.get_i32(2);
    }
}

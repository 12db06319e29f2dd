//! Bump allocation over a single caller-supplied buffer.
//!
//! Works like [`Arena`](crate::Arena) with exactly one block that never grows,
//! so it needs no backing heap at all (a static or stack buffer will do).

use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use crate::allocators::{align8, request_size, Allocator, Stats, ALIGN};

pub struct FixedAllocator<'buf> {
    mem: NonNull<u8>,
    /// Bump cursor.
    size: usize,
    cap: usize,
    /// Offset of the most recent allocation.
    last_alloc: Option<usize>,
    _buf: PhantomData<&'buf mut [u8]>,
}

impl<'buf> FixedAllocator<'buf> {
    /// Allocate out of `buf`. Bytes before the first 8-byte aligned address
    /// are skipped.
    pub fn new(buf: &'buf mut [u8]) -> Self {
        let skip = buf.as_ptr().align_offset(ALIGN).min(buf.len());
        let usable = &mut buf[skip..];
        let cap = usable.len();
        FixedAllocator {
            // A slice pointer is never null, even for an empty slice.
            mem: NonNull::from(usable).cast(),
            size: 0,
            cap,
            last_alloc: None,
            _buf: PhantomData,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn used(&self) -> usize {
        self.size
    }

    /// Rewind to the start of the buffer. Every pointer handed out so far
    /// becomes invalid.
    pub fn reset(&mut self) {
        self.size = 0;
        self.last_alloc = None;
    }

    pub fn stats(&self) -> Stats {
        Stats {
            blocks: 1,
            capacity: self.cap,
            occupied: self.size,
        }
    }

    fn bump(&mut self, real_size: usize) -> NonNull<u8> {
        let new_size = self.size + real_size;
        assert!(
            new_size <= self.cap,
            "[FixedAllocator]: out of memory ({} + {} > {})",
            self.size,
            real_size,
            self.cap
        );

        let offset = self.size;
        self.size = new_size;
        self.last_alloc = Some(offset);
        unsafe { NonNull::new_unchecked(self.mem.as_ptr().add(offset)) }
    }

    /// Offset of `ptr` in the buffer. A zero-byte allocation made when the
    /// buffer was full sits right on its end.
    fn offset_of(&self, ptr: NonNull<u8>) -> usize {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.mem.as_ptr() as usize);
        assert!(
            offset <= self.cap,
            "[FixedAllocator]: pointer doesn't belong to this buffer"
        );
        offset
    }
}

impl<'buf> Allocator for FixedAllocator<'buf> {
    fn alloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        self.bump(align8(request_size(count, elem_size)))
    }

    unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        count: usize,
        elem_size: usize,
    ) -> NonNull<u8> {
        let ptr = match ptr {
            None => return self.alloc(count, elem_size),
            Some(p) => p,
        };

        let requested = request_size(count, elem_size);
        let real_size = align8(requested);
        let offset = self.offset_of(ptr);

        if Some(offset) == self.last_alloc {
            let new_size = offset + real_size;
            assert!(
                new_size <= self.cap,
                "[FixedAllocator]: out of memory ({} > {})",
                new_size,
                self.cap
            );
            self.size = new_size;
            return ptr;
        }

        let new_ptr = self.bump(real_size);
        let new_offset = self.size - real_size;
        // Never read past the buffer, and never into the destination.
        let to_copy = requested.min(self.cap - offset).min(new_offset - offset);
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), to_copy);

        new_ptr
    }

    unsafe fn free(&mut self, _ptr: NonNull<u8>) {}

    fn free_all(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[repr(align(8))]
    struct Buffer([u8; 256]);

    #[test]
    fn test_bump_and_reset() {
        let mut buf = Buffer([0xAA; 256]);
        let mut fixed = FixedAllocator::new(&mut buf.0);
        assert_eq!(fixed.capacity(), 256);

        let a = fixed.alloc(5, 1);
        let b = fixed.zalloc(2, 8);
        assert_eq!(b.as_ptr(), unsafe { a.as_ptr().add(8) });
        assert_eq!(unsafe { core::slice::from_raw_parts(b.as_ptr(), 16) }, &[0; 16]);
        assert_eq!(fixed.used(), 24);

        // free and free_all don't do anything
        unsafe { fixed.free(a) };
        fixed.free_all();
        assert_eq!(fixed.used(), 24);

        fixed.reset();
        assert_eq!(fixed.used(), 0);
        let again = fixed.alloc(1, 1);
        assert_eq!(again, a);
    }

    #[test]
    fn test_realloc_last_in_place() {
        let mut buf = Buffer([0; 256]);
        let mut fixed = FixedAllocator::new(&mut buf.0);

        let _a = fixed.alloc(8, 1);
        let b = fixed.alloc(8, 1);
        unsafe {
            b.as_ptr().write(42);
            let c = fixed.realloc(Some(b), 100, 1);
            assert_eq!(b, c);
            assert_eq!(*c.as_ptr(), 42);
        }
        assert_eq!(fixed.used(), 8 + 104);
    }

    #[test]
    fn test_realloc_older_copies() {
        let mut buf = Buffer([0; 256]);
        let mut fixed = FixedAllocator::new(&mut buf.0);

        let a = fixed.alloc(8, 1);
        unsafe { ptr::write_bytes(a.as_ptr(), 9, 8) };
        let _b = fixed.alloc(8, 1);

        let c = unsafe { fixed.realloc(Some(a), 16, 1) };
        assert_eq!(c.as_ptr(), unsafe { a.as_ptr().add(16) });
        let copied = unsafe { core::slice::from_raw_parts(c.as_ptr(), 8) };
        assert_eq!(copied, &[9; 8]);
    }

    #[test]
    fn test_realloc_stops_at_new_allocation() {
        let mut buf = Buffer([0; 256]);
        let mut fixed = FixedAllocator::new(&mut buf.0);

        let a = fixed.alloc(16, 1);
        let b = fixed.alloc(16, 1);
        unsafe {
            ptr::write_bytes(a.as_ptr(), 3, 16);
            ptr::write_bytes(b.as_ptr(), 9, 16);

            // 64 bytes are asked for, but the destination is only 32 bytes on.
            let c = fixed.realloc(Some(a), 64, 1);
            assert_eq!(c.as_ptr(), a.as_ptr().add(32));
            let moved = core::slice::from_raw_parts(c.as_ptr(), 64);
            assert_eq!(&moved[..16], &[3; 16]);
            assert_eq!(&moved[16..32], &[9; 16]);
            assert_eq!(&moved[32..], &[0; 32]);
            assert_eq!(core::slice::from_raw_parts(b.as_ptr(), 16), &[9; 16]);
        }
        assert_eq!(fixed.used(), 96);
    }

    #[test]
    #[should_panic(expected = "[FixedAllocator]: out of memory")]
    fn test_realloc_at_full_buffer_is_out_of_memory() {
        let mut buf = Buffer([0; 256]);
        let mut fixed = FixedAllocator::new(&mut buf.0);
        fixed.alloc(256, 1);
        let end = fixed.alloc(0, 1);
        assert_eq!(fixed.used(), fixed.capacity());
        unsafe { fixed.realloc(Some(end), 8, 1) };
    }

    #[test]
    #[should_panic(expected = "[FixedAllocator]: pointer doesn't belong to this buffer")]
    fn test_foreign_pointer_is_fatal() {
        let mut buf = Buffer([0; 256]);
        let mut other = Buffer([0; 256]);
        let mut fixed = FixedAllocator::new(&mut buf.0);
        let mut elsewhere = FixedAllocator::new(&mut other.0);
        fixed.alloc(8, 1);
        elsewhere.alloc(8, 1);
        let foreign = elsewhere.alloc(8, 1);
        unsafe { fixed.realloc(Some(foreign), 16, 1) };
    }

    #[test]
    fn test_unaligned_buffer() {
        let mut buf = Buffer([0; 256]);
        let mut fixed = FixedAllocator::new(&mut buf.0[3..]);
        assert_eq!(fixed.capacity(), 248);
        let p = fixed.alloc(1, 1);
        assert_eq!(p.as_ptr() as usize % ALIGN, 0);
    }

    #[test]
    #[should_panic(expected = "[FixedAllocator]: out of memory")]
    fn test_overflow_is_fatal() {
        let mut buf = Buffer([0; 256]);
        let mut fixed = FixedAllocator::new(&mut buf.0);
        fixed.alloc(200, 1);
        fixed.alloc(100, 1);
    }
}

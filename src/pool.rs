//! A pool that keeps allocator instances in chunk cells.
//!
//! Useful when many short-lived allocators (one arena per request, say) are
//! needed: their headers live in one [`ChunkAllocator`] instead of being
//! scattered over the heap, and giving one back releases everything it held.

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::allocators::{Allocator, ALIGN};
use crate::chunk::ChunkAllocator;

pub struct AllocatorPool<A: Allocator> {
    cells: ChunkAllocator,
    rented: Vec<NonNull<A>>,
}

// Rented allocators are owned by the pool.
unsafe impl<A: Allocator + Send> Send for AllocatorPool<A> {}

impl<A: Allocator> AllocatorPool<A> {
    /// A pool taking room for `per_block` allocators at a time.
    pub fn new(per_block: usize) -> Self {
        assert!(
            align_of::<A>() <= ALIGN,
            "[AllocatorPool]: allocator alignment exceeds what cells guarantee"
        );
        let block_size = per_block.max(1) * <ChunkAllocator>::cell_size(size_of::<A>());
        AllocatorPool {
            cells: ChunkAllocator::new(size_of::<A>(), block_size),
            rented: Vec::new(),
        }
    }

    /// Move `allocator` into the pool and return a handle to it.
    ///
    /// The handle stays valid until it is given back or the pool is cleared.
    pub fn rent(&mut self, allocator: A) -> NonNull<A> {
        let cell: NonNull<A> = self.cells.alloc(1, size_of::<A>()).cast();
        unsafe { cell.as_ptr().write(allocator) };
        self.rented.push(cell);
        log::trace!("[AllocatorPool]: rented {:?}", cell);
        cell
    }

    /// Release everything `handle`'s allocator holds, drop it and free its
    /// cell.
    pub fn give_back(&mut self, handle: NonNull<A>) {
        let idx = match self.rented.iter().position(|&h| h == handle) {
            Some(idx) => idx,
            None => panic!("[AllocatorPool]: {:?} was not rented from this pool", handle),
        };
        self.rented.swap_remove(idx);

        unsafe {
            Self::release(handle);
            self.cells.free(handle.cast());
        }
    }

    pub fn rented(&self) -> usize {
        self.rented.len()
    }

    /// Give back every rented allocator and release the cells.
    pub fn free_all(&mut self) {
        for handle in self.rented.drain(..) {
            unsafe { Self::release(handle) };
        }
        self.cells.free_all();
    }

    unsafe fn release(handle: NonNull<A>) {
        (*handle.as_ptr()).free_all();
        ptr::drop_in_place(handle.as_ptr());
    }
}

impl<A: Allocator> Drop for AllocatorPool<A> {
    fn drop(&mut self) {
        self.free_all();
    }
}

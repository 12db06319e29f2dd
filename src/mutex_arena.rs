//! An [`Arena`] behind a spin lock.
//!
//! Every operation takes the lock for the duration of the call, so a
//! `MutexArena` can be shared between threads by reference. `&MutexArena`
//! implements [`Allocator`] too, which lets several threads each hold their
//! own `&mut dyn Allocator` into one arena.
//!
//! Since the constructor is `const`, a `MutexArena` can also serve as the
//! `#[global_allocator]` of programs that never need to give memory back:
//!
//! ```no_run
//! use blockalloc::{MutexArena, SIZE_1M};
//!
//! #[global_allocator]
//! static GLOBAL: MutexArena = MutexArena::new(SIZE_1M);
//!
//! fn main() {
//!     let v: Vec<u64> = (0..1000).collect();
//!     assert_eq!(v.len(), 1000);
//! }
//! ```
//!
//! The arena's log records are only handed to the logger once the lock is
//! released, since a logger may allocate. Running out of memory is fatal
//! there as well; the panic will most likely deadlock on the held lock
//! rather than unwind cleanly.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, null_mut, NonNull};

use spin::{Mutex, MutexGuard};

use crate::allocators::{Allocator, HeapGrower, Stats, SystemHeap, BLOCK_ALIGN, SIZE_8K};
use crate::arena::Arena;

pub struct MutexArena<G: HeapGrower = SystemHeap> {
    arena: Mutex<Arena<G>>,
}

impl MutexArena<SystemHeap> {
    pub const fn new(capacity: usize) -> Self {
        MutexArena {
            arena: Mutex::new(Arena::new_deferred(capacity)),
        }
    }
}

impl Default for MutexArena<SystemHeap> {
    fn default() -> Self {
        Self::new(SIZE_8K)
    }
}

impl<G: HeapGrower> MutexArena<G> {
    pub fn with_grower(capacity: usize, grower: G) -> Self {
        let mut arena = Arena::with_grower(capacity, grower);
        arena.set_deferred_logging(true);
        MutexArena {
            arena: Mutex::new(arena),
        }
    }

    /// Hold the lock for a batch of operations.
    ///
    /// Log records from inside the batch are held back until the next call
    /// through the `MutexArena` itself.
    pub fn lock(&self) -> MutexGuard<'_, Arena<G>> {
        self.arena.lock()
    }

    pub fn into_inner(self) -> Arena<G> {
        let mut arena = self.arena.into_inner();
        arena.set_deferred_logging(false);
        arena
    }

    /// Run `f` under the lock, then log what the arena recorded.
    fn locked<R>(&self, f: impl FnOnce(&mut Arena<G>) -> R) -> R {
        let (result, event) = {
            let mut arena = self.arena.lock();
            let result = f(&mut *arena);
            (result, arena.take_event())
        };
        if let Some(event) = event {
            event.log();
        }
        result
    }

    /// Same as [`locked`](MutexArena::locked), for callers with exclusive
    /// access.
    fn exclusive<R>(&mut self, f: impl FnOnce(&mut Arena<G>) -> R) -> R {
        let result = f(self.arena.get_mut());
        if let Some(event) = self.arena.get_mut().take_event() {
            event.log();
        }
        result
    }

    pub fn alloc(&self, count: usize, elem_size: usize) -> NonNull<u8> {
        self.locked(|arena| arena.alloc(count, elem_size))
    }

    pub fn zalloc(&self, count: usize, elem_size: usize) -> NonNull<u8> {
        self.locked(|arena| arena.zalloc(count, elem_size))
    }

    /// # Safety
    ///
    /// Same as [`Allocator::realloc`].
    pub unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        count: usize,
        elem_size: usize,
    ) -> NonNull<u8> {
        self.locked(|arena| arena.realloc(ptr, count, elem_size))
    }

    /// # Safety
    ///
    /// Same as [`Allocator::free`].
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.locked(|arena| arena.free(ptr))
    }

    pub fn free_all(&self) {
        self.locked(|arena| arena.free_all())
    }

    pub fn reset(&self) {
        self.locked(|arena| arena.reset())
    }

    pub fn stats(&self) -> Stats {
        self.arena.lock().stats()
    }
}

impl<G: HeapGrower> Allocator for MutexArena<G> {
    // Exclusive access already rules out other threads; no locking needed.

    fn alloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        self.exclusive(|arena| arena.alloc(count, elem_size))
    }

    fn zalloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        self.exclusive(|arena| arena.zalloc(count, elem_size))
    }

    unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        count: usize,
        elem_size: usize,
    ) -> NonNull<u8> {
        self.exclusive(|arena| arena.realloc(ptr, count, elem_size))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        self.exclusive(|arena| arena.free(ptr))
    }

    fn free_all(&mut self) {
        self.exclusive(|arena| arena.free_all())
    }
}

impl<G: HeapGrower> Allocator for &MutexArena<G> {
    fn alloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        MutexArena::alloc(self, count, elem_size)
    }

    fn zalloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        MutexArena::zalloc(self, count, elem_size)
    }

    unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        count: usize,
        elem_size: usize,
    ) -> NonNull<u8> {
        MutexArena::realloc(self, ptr, count, elem_size)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        MutexArena::free(self, ptr)
    }

    fn free_all(&mut self) {
        MutexArena::free_all(self)
    }
}

/// Requests aligned to more than [`BLOCK_ALIGN`] bytes get a null pointer.
/// `dealloc` does nothing; memory is only reclaimed through `free_all` or
/// `reset`.
unsafe impl<G: HeapGrower + Send> GlobalAlloc for MutexArena<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return null_mut();
        }
        self.locked(|arena| arena.alloc_aligned(layout.size(), layout.align()))
            .as_ptr()
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = GlobalAlloc::alloc(self, layout);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {}

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return null_mut();
        }
        self.locked(|arena| arena.realloc_aligned(NonNull::new(ptr), new_size, layout.align()))
            .as_ptr()
    }
}

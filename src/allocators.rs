//! The allocation contract and the memory every strategy is built on.
//!
//! ## Basic Types
//!
//! ### [`Allocator`](trait.Allocator.html)
//!
//! The five-operation contract (`alloc`, `zalloc`, `realloc`, `free`,
//! `free_all`) shared by every strategy in this crate. It is object safe, so
//! containers can hold a `&mut dyn Allocator` and never care which strategy is
//! behind it.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` is a simple trait interface meant to abstract over the calls
//! to the OS for new blocks. Every block-based allocator takes one as a type
//! parameter, defaulting to [`SystemHeap`](struct.SystemHeap.html).
//!
//! ### [`OsAllocator`](struct.OsAllocator.html)
//!
//! An allocator that hands every request straight to its `HeapGrower`. It
//! cannot release everything at once, so `free_all` is a fatal error.

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{self, NonNull};

#[cfg(feature = "use_libc")]
use errno::Errno;
use static_assertions::const_assert;
use std::alloc::System;

pub const SIZE_MIN: usize = 2;
pub const SIZE_1K: usize = 1024;
pub const SIZE_8K: usize = 8 * SIZE_1K;
pub const SIZE_1M: usize = SIZE_1K * SIZE_1K;
pub const SIZE_8M: usize = 8 * SIZE_1M;
pub const SIZE_1G: usize = SIZE_1M * SIZE_1K;

/// Every allocation handed out by this crate is aligned to this many bytes.
pub const ALIGN: usize = 8;

/// Memory returned by a [`HeapGrower`] is aligned to this many bytes, and all
/// block headers are padded to a multiple of it.
pub const BLOCK_ALIGN: usize = 16;

const_assert!(BLOCK_ALIGN % ALIGN == 0);

/// Round up value to the nearest multiple of increment
pub const fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// Round up to the crate-wide alignment unit.
pub const fn align8(value: usize) -> usize {
    (value + ALIGN - 1) & !(ALIGN - 1)
}

/// Size in bytes of `count` elements of `elem_size` bytes.
///
/// Panics on overflow; there is no allocation that large.
pub(crate) fn request_size(count: usize, elem_size: usize) -> usize {
    match count.checked_mul(elem_size) {
        Some(size) => size,
        None => panic!(
            "allocation size overflow: {} elements of {} bytes",
            count, elem_size
        ),
    }
}

/// The allocation contract.
///
/// Strategies that cannot support an operation panic when it is called,
/// rather than silently doing something else.
pub trait Allocator {
    /// Allocate space for `count` elements of `elem_size` bytes each.
    ///
    /// The returned pointer is aligned to [`ALIGN`] bytes. Running out of
    /// memory is fatal, so this never returns null.
    fn alloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8>;

    /// Same as [`alloc`](Allocator::alloc), with the requested bytes zeroed.
    fn zalloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        let ptr = self.alloc(count, elem_size);
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, request_size(count, elem_size)) };
        ptr
    }

    /// Resize an allocation, possibly moving it. `None` behaves as `alloc`.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this allocator and not have been freed since.
    unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        count: usize,
        elem_size: usize,
    ) -> NonNull<u8>;

    /// Give an allocation back.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this allocator and not have been freed since.
    /// It must not be used afterwards.
    unsafe fn free(&mut self, ptr: NonNull<u8>);

    /// Release everything this allocator owns. Every pointer it has handed out
    /// becomes invalid.
    fn free_all(&mut self);
}

/// A snapshot of how much memory an allocator holds and uses.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of blocks taken from the heap grower.
    pub blocks: usize,
    /// Usable bytes across all blocks (headers excluded).
    pub capacity: usize,
    /// Bytes currently handed out, including per-allocation headers.
    pub occupied: usize,
}

pub trait HeapGrower {
    type Err: fmt::Debug;

    /// Get at least `size` bytes of fresh, zero-filled memory, aligned to
    /// [`BLOCK_ALIGN`].
    ///
    /// # Safety
    ///
    /// The returned memory must be available and untracked by any other rust
    /// code, including the allocator itself, until it is passed to `release`.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Return memory obtained from `grow_heap`.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must be exactly what an earlier `grow_heap` call
    /// returned and was asked for, and nothing may use the memory afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize);
}

/// Take a block from `grower`, treating failure as fatal.
pub(crate) fn grow_or_die<G: HeapGrower>(grower: &mut G, size: usize) -> NonNull<u8> {
    match unsafe { grower.grow_heap(size) } {
        Ok(ptr) => ptr,
        Err(err) => {
            log::error!("heap growth of {} bytes failed: {:?}", size, err);
            out_of_memory(size)
        }
    }
}

/// Same as [`grow_or_die`], but never enters the logger. Used on paths that
/// can run inside a `#[global_allocator]`, where logging may allocate.
pub(crate) fn grow_or_die_unlogged<G: HeapGrower>(grower: &mut G, size: usize) -> NonNull<u8> {
    match unsafe { grower.grow_heap(size) } {
        Ok(ptr) => ptr,
        Err(_) => out_of_memory(size),
    }
}

fn out_of_memory(size: usize) -> ! {
    panic!("out of memory: heap growth of {} bytes failed", size)
}

/// SystemHeap takes blocks straight from the system allocator, bypassing any
/// `#[global_allocator]` (which may itself be built on this crate).
#[derive(Default, Debug)]
pub struct SystemHeap {
    // Just for tracking, not really needed
    pub growths: usize,
    pub bytes: usize,
}

impl SystemHeap {
    pub const fn new() -> Self {
        SystemHeap {
            growths: 0,
            bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemHeapError {
    pub size: usize,
}

impl fmt::Display for SystemHeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "system allocator refused {} bytes", self.size)
    }
}

impl std::error::Error for SystemHeapError {}

impl HeapGrower for SystemHeap {
    type Err = SystemHeapError;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, SystemHeapError> {
        let layout = Layout::from_size_align(size.max(BLOCK_ALIGN), BLOCK_ALIGN)
            .map_err(|_| SystemHeapError { size })?;
        let ptr = NonNull::new(System.alloc_zeroed(layout)).ok_or(SystemHeapError { size })?;

        self.growths += 1;
        self.bytes += layout.size();

        Ok(ptr)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align_unchecked(size.max(BLOCK_ALIGN), BLOCK_ALIGN);
        self.bytes -= layout.size();
        System.dealloc(ptr.as_ptr(), layout);
    }
}

/// LibcHeap takes blocks from the C heap with `calloc`.
#[cfg(feature = "use_libc")]
#[derive(Default, Debug)]
pub struct LibcHeap {
    // Just for tracking, not really needed
    pub growths: usize,
    pub bytes: usize,
}

#[cfg(feature = "use_libc")]
impl HeapGrower for LibcHeap {
    type Err = Errno;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Errno> {
        // malloc only promises alignment for the largest fundamental type,
        // which is 16 on the platforms we care about.
        let ptr = libc::calloc(1, size.max(BLOCK_ALIGN)) as *mut u8;
        let ptr = NonNull::new(ptr).ok_or_else(errno::errno)?;
        debug_assert_eq!(ptr.as_ptr() as usize % BLOCK_ALIGN, 0);

        self.growths += 1;
        self.bytes += size;

        Ok(ptr)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        self.bytes -= size;
        libc::free(ptr.as_ptr() as *mut libc::c_void);
    }
}

/// Every allocation carries its total size just before the payload.
const OS_HEADER_SIZE: usize = BLOCK_ALIGN;
const_assert!(OS_HEADER_SIZE >= core::mem::size_of::<usize>());

/// Forwards every request to the heap grower, one grower call per allocation.
///
/// `free_all` is not supported: the grower has no notion of "everything".
#[derive(Default)]
pub struct OsAllocator<G = SystemHeap> {
    pub grower: G,
}

impl OsAllocator<SystemHeap> {
    pub const fn new() -> Self {
        OsAllocator {
            grower: SystemHeap::new(),
        }
    }
}

impl<G: HeapGrower> OsAllocator<G> {
    pub fn with_grower(grower: G) -> Self {
        OsAllocator { grower }
    }

    /// The total region size recorded in front of `ptr`.
    unsafe fn region_size(ptr: NonNull<u8>) -> usize {
        (ptr.as_ptr().sub(OS_HEADER_SIZE) as *const usize).read()
    }
}

impl<G: HeapGrower> Allocator for OsAllocator<G> {
    fn alloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        let total = OS_HEADER_SIZE + request_size(count, elem_size);
        let region = grow_or_die(&mut self.grower, total);
        unsafe {
            (region.as_ptr() as *mut usize).write(total);
            NonNull::new_unchecked(region.as_ptr().add(OS_HEADER_SIZE))
        }
    }

    fn zalloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        // Grown memory is already zero-filled.
        self.alloc(count, elem_size)
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

        let old_payload = Self::region_size(ptr) - OS_HEADER_SIZE;
        let new_ptr = self.alloc(count, elem_size);
        let to_copy = old_payload.min(request_size(count, elem_size));
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), to_copy);
        self.free(ptr);

        new_ptr
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let total = Self::region_size(ptr);
        let region = NonNull::new_unchecked(ptr.as_ptr().sub(OS_HEADER_SIZE));
        self.grower.release(region, total);
    }

    fn free_all(&mut self) {
        panic!("[OsAllocator]: no free_all()");
    }
}

//! A region allocator: bump allocation over a growable chain of blocks.
//!
//! Individual frees do nothing; memory only comes back all at once with
//! [`free_all`](crate::Allocator::free_all) (or when the arena is dropped).
//! The most recent allocation of each block can be grown in place, which
//! makes append-style reallocation amortized O(1).

use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};

use static_assertions::const_assert;

use crate::allocators::{
    align8, grow_or_die, grow_or_die_unlogged, request_size, round_up, Allocator, HeapGrower,
    Stats, SystemHeap, ALIGN, BLOCK_ALIGN, SIZE_8K,
};

/// The header in front of every arena block. The block's usable memory
/// follows it directly.
#[repr(C, align(16))]
struct ArenaBlock {
    next: Option<NonNull<ArenaBlock>>,
    /// Usable bytes after the header.
    size: usize,
    /// Bump cursor; always `last_alloc + last_alloc_size`.
    occupied: usize,
    /// Offset of the most recent allocation.
    last_alloc: usize,
    last_alloc_size: usize,
}

const BLOCK_HEADER_SIZE: usize = size_of::<ArenaBlock>();
const_assert!(BLOCK_HEADER_SIZE % BLOCK_ALIGN == 0);

impl ArenaBlock {
    unsafe fn mem(block: NonNull<ArenaBlock>) -> *mut u8 {
        (block.as_ptr() as *mut u8).add(BLOCK_HEADER_SIZE)
    }

    unsafe fn contains(block: NonNull<ArenaBlock>, ptr: *const u8) -> bool {
        let start = Self::mem(block) as *const u8;
        ptr >= start && ptr < start.add((*block.as_ptr()).size)
    }
}

/// A log record an arena holds back until its caller has dropped any lock
/// around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArenaEvent {
    NewBlock {
        size: usize,
        at: usize,
        /// The block was taken for a request of at least the default capacity.
        oversized: bool,
    },
    Reset,
    Released { blocks: usize },
}

impl ArenaEvent {
    pub(crate) fn log(&self) {
        match *self {
            ArenaEvent::NewBlock {
                size,
                at,
                oversized,
            } => log::debug!(
                "[Arena]: new block of {} bytes at {:#x}{}",
                size,
                at,
                if oversized {
                    ", beyond the default capacity"
                } else {
                    ""
                }
            ),
            ArenaEvent::Reset => log::debug!("[Arena]: reset"),
            ArenaEvent::Released { blocks } => log::debug!("[Arena]: releasing {} blocks", blocks),
        }
    }
}

pub struct Arena<G: HeapGrower = SystemHeap> {
    pub grower: G,
    default_capacity: usize,
    blocks: Option<NonNull<ArenaBlock>>,
    /// When set, log records wait in `pending` instead of going to the logger.
    defer_logs: bool,
    pending: Option<ArenaEvent>,
}

// The arena owns its whole block chain, so moving it to another thread moves
// all of it.
unsafe impl<G: HeapGrower + Send> Send for Arena<G> {}

impl Arena<SystemHeap> {
    /// Create an arena whose blocks hold at least `capacity` bytes each.
    ///
    /// No memory is taken until the first allocation.
    pub const fn new(capacity: usize) -> Self {
        Self::build(capacity, false)
    }

    /// An arena that keeps its log records for [`take_event`](Arena::take_event).
    pub(crate) const fn new_deferred(capacity: usize) -> Self {
        Self::build(capacity, true)
    }

    const fn build(capacity: usize, defer_logs: bool) -> Self {
        Arena {
            grower: SystemHeap::new(),
            default_capacity: align8(capacity),
            blocks: None,
            defer_logs,
            pending: None,
        }
    }
}

impl Default for Arena<SystemHeap> {
    fn default() -> Self {
        Self::new(SIZE_8K)
    }
}

impl<G: HeapGrower> Arena<G> {
    pub fn with_grower(capacity: usize, grower: G) -> Self {
        Arena {
            grower,
            default_capacity: align8(capacity),
            blocks: None,
            defer_logs: false,
            pending: None,
        }
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }

    /// Switch between logging straight away and holding records back.
    /// Turning deferral off logs anything still pending.
    pub(crate) fn set_deferred_logging(&mut self, defer: bool) {
        self.defer_logs = defer;
        if !defer {
            if let Some(event) = self.pending.take() {
                event.log();
            }
        }
    }

    /// The record held back by the last operation, if any. Only the latest
    /// one is kept.
    pub(crate) fn take_event(&mut self) -> Option<ArenaEvent> {
        self.pending.take()
    }

    fn note(&mut self, event: ArenaEvent) {
        if self.defer_logs {
            self.pending = Some(event);
        } else {
            event.log();
        }
    }

    fn iter_blocks(&self) -> impl Iterator<Item = NonNull<ArenaBlock>> + '_ {
        let mut next = self.blocks;
        core::iter::from_fn(move || {
            let block = next?;
            next = unsafe { (*block.as_ptr()).next };
            Some(block)
        })
    }

    fn block_of(&self, ptr: *const u8) -> Option<NonNull<ArenaBlock>> {
        self.iter_blocks()
            .find(|&block| unsafe { ArenaBlock::contains(block, ptr) })
    }

    fn fitting_block(&self, size: usize) -> Option<NonNull<ArenaBlock>> {
        self.iter_blocks().find(|&block| unsafe {
            let block = &*block.as_ptr();
            block.size - block.occupied > size
        })
    }

    fn prepend_block(&mut self, size: usize, oversized: bool) -> NonNull<ArenaBlock> {
        let raw = if self.defer_logs {
            grow_or_die_unlogged(&mut self.grower, BLOCK_HEADER_SIZE + size)
        } else {
            grow_or_die(&mut self.grower, BLOCK_HEADER_SIZE + size)
        };
        let block: NonNull<ArenaBlock> = raw.cast();
        unsafe {
            block.as_ptr().write(ArenaBlock {
                next: self.blocks,
                size,
                occupied: 0,
                last_alloc: 0,
                last_alloc_size: 0,
            });
        }
        self.blocks = Some(block);
        self.note(ArenaEvent::NewBlock {
            size,
            at: block.as_ptr() as usize,
            oversized,
        });
        block
    }

    /// Allocate `size` bytes at an address that is a multiple of `align`.
    ///
    /// `align` must be a power of two no larger than [`BLOCK_ALIGN`]. Any
    /// padding in front of the allocation counts as occupied.
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> NonNull<u8> {
        assert!(
            align.is_power_of_two() && align <= BLOCK_ALIGN,
            "[Arena]: unsupported alignment {}",
            align
        );
        let align = align.max(ALIGN);
        let real_size = align8(size);
        // The cursor is always a multiple of ALIGN, so this covers any padding.
        let worst_case = real_size + (align - ALIGN);

        let block = match self.fitting_block(worst_case) {
            Some(block) => block,
            None => self.prepend_block(
                self.default_capacity.max(worst_case * 2),
                worst_case >= self.default_capacity,
            ),
        };

        unsafe {
            // Block memory starts BLOCK_ALIGN-aligned, so aligning the offset
            // aligns the address.
            let header = &mut *block.as_ptr();
            let offset = round_up(header.occupied, align);
            header.last_alloc = offset;
            header.last_alloc_size = real_size;
            header.occupied = offset + real_size;

            NonNull::new_unchecked(ArenaBlock::mem(block).add(offset))
        }
    }

    /// [`realloc`](Allocator::realloc) for an allocation made with
    /// [`alloc_aligned`](Arena::alloc_aligned). A moved allocation keeps the
    /// alignment `align`.
    ///
    /// # Safety
    ///
    /// Same as [`Allocator::realloc`].
    pub unsafe fn realloc_aligned(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        align: usize,
    ) -> NonNull<u8> {
        let ptr = match ptr {
            None => return self.alloc_aligned(size, align),
            Some(p) => p,
        };

        let real_size = align8(size);
        let block = match self.block_of(ptr.as_ptr()) {
            Some(block) => block,
            None => panic!("[Arena]: pointer doesn't belong to this arena"),
        };

        let mem = ArenaBlock::mem(block);
        let header = &mut *block.as_ptr();
        let last = mem.add(header.last_alloc);

        if ptr.as_ptr() == last && header.last_alloc + real_size <= header.size {
            // Bump case: grow (or keep) the most recent allocation in place.
            if header.last_alloc_size < size {
                header.last_alloc_size = real_size;
                header.occupied = header.last_alloc + real_size;
            }
            return ptr;
        }

        let bytes_to_block_end = header.size - (ptr.as_ptr() as usize - mem as usize);
        let new_ptr = self.alloc_aligned(size, align);

        // The old size is unknown: copy what the new allocation holds, without
        // reading past the old block or into the new allocation.
        let mut to_copy = size.min(bytes_to_block_end);
        let (src, dst) = (ptr.as_ptr() as usize, new_ptr.as_ptr() as usize);
        if dst > src && dst < src + to_copy {
            to_copy = dst - src;
        }
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), to_copy);

        new_ptr
    }

    /// Rewind every block to empty without giving any memory back.
    ///
    /// All outstanding pointers become invalid.
    pub fn reset(&mut self) {
        for block in self.iter_blocks() {
            unsafe {
                let block = &mut *block.as_ptr();
                block.occupied = 0;
                block.last_alloc = 0;
                block.last_alloc_size = 0;
            }
        }
        self.note(ArenaEvent::Reset);
    }

    pub fn stats(&self) -> Stats {
        self.iter_blocks().fold(Stats::default(), |mut stats, block| {
            let block = unsafe { &*block.as_ptr() };
            stats.blocks += 1;
            stats.capacity += block.size;
            stats.occupied += block.occupied;
            stats
        })
    }

    fn release_blocks(&mut self) {
        let mut next = self.blocks.take();
        while let Some(block) = next {
            unsafe {
                let size = (*block.as_ptr()).size;
                next = (*block.as_ptr()).next;
                self.grower.release(block.cast(), BLOCK_HEADER_SIZE + size);
            }
        }
    }
}

impl<G: HeapGrower> Allocator for Arena<G> {
    fn alloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        self.alloc_aligned(request_size(count, elem_size), ALIGN)
    }

    unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        count: usize,
        elem_size: usize,
    ) -> NonNull<u8> {
        self.realloc_aligned(ptr, request_size(count, elem_size), ALIGN)
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // Region memory is only reclaimed in bulk.
        debug_assert!(
            self.block_of(ptr.as_ptr()).is_some(),
            "[Arena]: pointer doesn't belong to this arena"
        );
    }

    fn free_all(&mut self) {
        let blocks = self.stats().blocks;
        self.note(ArenaEvent::Released { blocks });
        self.release_blocks();
    }
}

impl<G: HeapGrower> Drop for Arena<G> {
    fn drop(&mut self) {
        self.release_blocks();
    }
}

impl<G: HeapGrower> fmt::Display for Arena<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Arena(")?;
        let mut start = true;
        for block in self.iter_blocks() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            let header = unsafe { &*block.as_ptr() };
            write!(f, "Block({:?}, {}/{})", block, header.occupied, header.size)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        unsafe { ptr::write_bytes(ptr.as_ptr(), byte, len) };
    }

    fn bytes<'a>(ptr: NonNull<u8>, len: usize) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) }
    }

    #[test]
    fn test_bump() {
        let mut arena = Arena::new(256);
        assert_eq!(arena.stats().blocks, 0);

        let a = arena.alloc(3, 1);
        let b = arena.alloc(1, 16);
        let c = arena.zalloc(2, 4);

        // Sizes are padded to 8 bytes and laid out back to back.
        unsafe {
            assert_eq!(b.as_ptr(), a.as_ptr().add(8));
            assert_eq!(c.as_ptr(), b.as_ptr().add(16));
        }
        assert_eq!(a.as_ptr() as usize % 8, 0);
        assert_eq!(bytes(c, 8), &[0; 8]);

        let stats = arena.stats();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.capacity, 256);
        assert_eq!(stats.occupied, 32);
    }

    #[test]
    fn test_growth_keeps_old_pointers() {
        let mut arena = Arena::new(128);
        let mut allocs = Vec::new();

        for i in 0..40u8 {
            let len = 8 + (i as usize % 5) * 8;
            let p = arena.alloc(len, 1);
            fill(p, len, i);
            allocs.push((p, len, i));
        }

        assert!(arena.stats().blocks > 1);
        for &(p, len, i) in &allocs {
            assert!(bytes(p, len).iter().all(|&b| b == i));
        }
        log::info!("{}", arena);
    }

    #[test]
    fn test_large_allocation_grows_double() {
        let mut arena = Arena::new(64);
        arena.alloc(100, 1);
        // 100 bytes pad to 104, and the new block is twice that.
        assert_eq!(arena.stats().capacity, 208);
    }

    #[test]
    fn test_realloc_in_place() {
        let mut arena = Arena::new(1024);
        let p = arena.alloc(16, 1);
        fill(p, 16, 7);

        unsafe {
            let q = arena.realloc(Some(p), 64, 1);
            assert_eq!(p, q);
            assert_eq!(bytes(q, 16), &[7; 16]);
            assert_eq!(arena.stats().occupied, 64);

            // Shrinking the last allocation keeps it where it is, too.
            let r = arena.realloc(Some(q), 8, 1);
            assert_eq!(q, r);
            assert_eq!(arena.stats().occupied, 64);
        }

        // The next allocation lands after the grown one.
        let next = arena.alloc(1, 1);
        assert_eq!(next.as_ptr(), unsafe { p.as_ptr().add(64) });
    }

    #[test]
    fn test_realloc_moves_older_allocation() {
        let mut arena = Arena::new(1024);
        let p = arena.alloc(16, 1);
        fill(p, 16, 3);
        let _q = arena.alloc(16, 1);

        let moved = unsafe { arena.realloc(Some(p), 32, 1) };
        assert_ne!(moved, p);
        assert_eq!(bytes(moved, 16), &[3; 16]);
    }

    #[test]
    fn test_realloc_stops_at_new_allocation() {
        let mut arena = Arena::new(1024);
        let p = arena.alloc(16, 1);
        fill(p, 16, 3);
        let q = arena.alloc(16, 1);
        fill(q, 16, 9);

        // The moved allocation starts 32 bytes after the old one, so the copy
        // stops there instead of running into its own destination.
        let moved = unsafe { arena.realloc(Some(p), 64, 1) };
        assert_eq!(moved.as_ptr(), unsafe { p.as_ptr().add(32) });
        assert_eq!(bytes(moved, 16), &[3; 16]);
        assert_eq!(&bytes(moved, 32)[16..], &[9; 16]);
        assert_eq!(&bytes(moved, 64)[32..], &[0; 32]);
        assert_eq!(bytes(q, 16), &[9; 16]);
        assert_eq!(arena.stats().occupied, 96);
    }

    #[test]
    fn test_realloc_near_block_end() {
        let mut arena = Arena::new(80);
        let a = arena.alloc(40, 1);
        fill(a, 40, 1);
        let b = arena.alloc(16, 1);
        fill(b, 16, 2);
        assert_eq!(arena.stats().capacity, 80);

        // b sits 40 bytes before the end of its block; only those are copied.
        let moved = unsafe { arena.realloc(Some(b), 100, 1) };
        assert_eq!(arena.stats().blocks, 2);
        assert_eq!(bytes(moved, 16), &[2; 16]);
        assert!(bytes(moved, 100)[16..].iter().all(|&b| b == 0));
        assert_eq!(bytes(a, 40), &[1; 40]);
    }

    #[test]
    fn test_aligned_allocations() {
        let mut arena = Arena::new(256);
        let a = arena.alloc(1, 1);
        let b = arena.alloc_aligned(24, 16);
        assert_eq!(b.as_ptr() as usize % 16, 0);
        assert_eq!(b.as_ptr(), unsafe { a.as_ptr().add(16) });
        // The padding counts as occupied.
        assert_eq!(arena.stats().occupied, 40);

        unsafe {
            let c = arena.realloc_aligned(Some(b), 48, 16);
            assert_eq!(b, c);
            assert_eq!(arena.stats().occupied, 64);

            arena.alloc(1, 1);
            let d = arena.realloc_aligned(Some(c), 64, 16);
            assert_ne!(c, d);
            assert_eq!(d.as_ptr() as usize % 16, 0);
            assert_eq!(d.as_ptr(), a.as_ptr().add(80));
        }
    }

    #[test]
    #[should_panic(expected = "[Arena]: unsupported alignment 32")]
    fn test_alignment_above_block_alignment_is_fatal() {
        Arena::new(256).alloc_aligned(8, 32);
    }

    #[test]
    fn test_deferred_log_records() {
        let mut arena = Arena::new_deferred(64);
        arena.alloc(8, 1);
        match arena.take_event() {
            Some(ArenaEvent::NewBlock {
                size: 64,
                oversized: false,
                ..
            }) => {}
            other => panic!("unexpected record {:?}", other),
        }
        arena.alloc(8, 1);
        assert_eq!(arena.take_event(), None);

        arena.alloc(100, 1);
        assert!(matches!(
            arena.take_event(),
            Some(ArenaEvent::NewBlock {
                size: 208,
                oversized: true,
                ..
            })
        ));

        arena.reset();
        assert_eq!(arena.take_event(), Some(ArenaEvent::Reset));
        arena.free_all();
        assert_eq!(arena.take_event(), Some(ArenaEvent::Released { blocks: 2 }));

        arena.set_deferred_logging(false);
        arena.alloc(8, 1);
        assert_eq!(arena.take_event(), None);
    }

    #[test]
    fn test_realloc_none_allocates() {
        let mut arena = Arena::new(64);
        let p = unsafe { arena.realloc(None, 2, 8) };
        assert_eq!(arena.stats().occupied, 16);
        unsafe { arena.free(p) };
        // free() never gives anything back.
        assert_eq!(arena.stats().occupied, 16);
    }

    #[test]
    fn test_reset_and_free_all() {
        let mut arena = Arena::new(64);
        let first = arena.alloc(8, 1);
        arena.alloc(200, 1);
        assert_eq!(arena.stats().blocks, 2);

        arena.reset();
        let stats = arena.stats();
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.occupied, 0);

        arena.free_all();
        assert_eq!(arena.stats(), Stats::default());
        assert_eq!(arena.grower.bytes, 0);

        // Still usable after a bulk release.
        let again = arena.alloc(8, 1);
        assert_eq!(arena.stats().blocks, 1);
        let _ = (first, again);
    }

    #[test]
    fn test_through_trait_object() {
        let mut arena = Arena::default();
        let alloc: &mut dyn Allocator = &mut arena;
        let p = alloc.zalloc(4, 4);
        let q = unsafe { alloc.realloc(Some(p), 8, 4) };
        assert_eq!(p, q);
        alloc.free_all();
        assert_eq!(arena.stats().blocks, 0);
    }
}

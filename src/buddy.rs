//! A power-of-two buddy allocator.
//!
//! Every block is a power of two in size and is treated as an implicit binary
//! tree of nodes: a node is a header followed by its payload, and the next
//! node starts `size` bytes further on. Allocation takes the first free node
//! that is large enough and halves it until the half would be too small.
//!
//! Freed nodes are not merged back with their buddies, so a block that has
//! been split stays split until [`free_all`](crate::Allocator::free_all).

use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};

use static_assertions::const_assert;

use crate::allocators::{
    grow_or_die, request_size, Allocator, HeapGrower, Stats, SystemHeap, ALIGN, BLOCK_ALIGN,
    SIZE_8K,
};

/// The smallest block a buddy allocator will manage.
pub const MIN_BLOCK_SIZE: usize = 128;

#[repr(C, align(16))]
struct BuddyBlock {
    next: Option<NonNull<BuddyBlock>>,
    /// Bytes of nodes after the header; a power of two.
    size: usize,
    /// Total size of the occupied nodes.
    occupied: usize,
}

const BLOCK_HEADER_SIZE: usize = size_of::<BuddyBlock>();
const_assert!(BLOCK_HEADER_SIZE % BLOCK_ALIGN == 0);

#[repr(C)]
struct BuddyNode {
    /// Size of the node, header included; a power of two.
    size: usize,
    is_free: bool,
}

const NODE_HEADER_SIZE: usize = 16;
const_assert!(size_of::<BuddyNode>() <= NODE_HEADER_SIZE);
const_assert!(NODE_HEADER_SIZE % ALIGN == 0);

impl BuddyBlock {
    unsafe fn mem(block: NonNull<BuddyBlock>) -> *mut u8 {
        (block.as_ptr() as *mut u8).add(BLOCK_HEADER_SIZE)
    }
}

unsafe fn node_of(ptr: NonNull<u8>) -> *mut BuddyNode {
    ptr.as_ptr().sub(NODE_HEADER_SIZE) as *mut BuddyNode
}

pub struct Buddy<G: HeapGrower = SystemHeap> {
    pub grower: G,
    block_size: usize,
    blocks: Option<NonNull<BuddyBlock>>,
}

unsafe impl<G: HeapGrower + Send> Send for Buddy<G> {}

impl Buddy<SystemHeap> {
    /// `block_size` is rounded up to a power of two, and must be at least
    /// [`MIN_BLOCK_SIZE`].
    pub fn new(block_size: usize) -> Self {
        Self::with_grower(block_size, SystemHeap::new())
    }
}

impl Default for Buddy<SystemHeap> {
    fn default() -> Self {
        Self::new(SIZE_8K)
    }
}

impl<G: HeapGrower> Buddy<G> {
    pub fn with_grower(block_size: usize, grower: G) -> Self {
        assert!(
            block_size >= MIN_BLOCK_SIZE,
            "[Buddy]: block size {} is below the minimum of {}",
            block_size,
            MIN_BLOCK_SIZE
        );
        Buddy {
            grower,
            block_size: block_size.next_power_of_two(),
            blocks: None,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Size of the node holding `ptr`, header included.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not freed.
    pub unsafe fn node_size(&self, ptr: NonNull<u8>) -> usize {
        (*node_of(ptr)).size
    }

    fn iter_blocks(&self) -> impl Iterator<Item = NonNull<BuddyBlock>> + '_ {
        let mut next = self.blocks;
        core::iter::from_fn(move || {
            let block = next?;
            next = unsafe { (*block.as_ptr()).next };
            Some(block)
        })
    }

    /// A block that looks like it has room for a node of `needed` bytes.
    fn fitting_block(&self, needed: usize) -> Option<NonNull<BuddyBlock>> {
        let rounded = needed.next_power_of_two();
        self.iter_blocks().find(|&block| unsafe {
            let block = &*block.as_ptr();
            block.size >= needed && block.size >= block.occupied + rounded
        })
    }

    fn prepend_block(&mut self, requested: usize) -> NonNull<BuddyBlock> {
        let size = self
            .block_size
            .max((2 * requested).next_power_of_two());
        let raw = grow_or_die(&mut self.grower, BLOCK_HEADER_SIZE + size);
        let block: NonNull<BuddyBlock> = raw.cast();

        unsafe {
            (BuddyBlock::mem(block) as *mut BuddyNode).write(BuddyNode {
                size,
                is_free: true,
            });
            block.as_ptr().write(BuddyBlock {
                next: self.blocks,
                size,
                occupied: 0,
            });
        }
        self.blocks = Some(block);
        log::debug!("[Buddy]: new block of {} bytes at {:?}", size, block);
        block
    }

    /// The first free node of at least `needed` bytes, in address order.
    unsafe fn find_free_node(block: NonNull<BuddyBlock>, needed: usize) -> Option<*mut BuddyNode> {
        let mem = BuddyBlock::mem(block);
        let end = mem.add((*block.as_ptr()).size);

        let mut it = mem;
        while it < end {
            let node = it as *mut BuddyNode;
            if (*node).is_free && (*node).size >= needed {
                return Some(node);
            }
            it = it.add((*node).size);
        }
        None
    }

    /// Halve `node` while the first half still holds `needed` bytes.
    unsafe fn split(node: *mut BuddyNode, needed: usize) {
        while (*node).size / 2 >= needed {
            let half = (*node).size / 2;
            let buddy = (node as *mut u8).add(half) as *mut BuddyNode;
            buddy.write(BuddyNode {
                size: half,
                is_free: true,
            });
            (*node).size = half;
            (*node).is_free = true;
            log::trace!("[Buddy]: split {:?} to {} bytes", node, half);
        }
    }

    /// The block holding the node that starts at `node`. A header-only node
    /// at the end of a block has its payload pointer on the block's end, so
    /// ownership goes by the node address.
    fn block_of(&self, node: *const u8) -> Option<NonNull<BuddyBlock>> {
        self.iter_blocks().find(|&block| unsafe {
            let start = BuddyBlock::mem(block) as *const u8;
            node >= start && node < start.add((*block.as_ptr()).size)
        })
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

impl<G: HeapGrower> Allocator for Buddy<G> {
    fn alloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        let requested = request_size(count, elem_size);
        let needed = requested + NODE_HEADER_SIZE;

        let mut block = match self.fitting_block(needed) {
            Some(block) => block,
            None => self.prepend_block(requested),
        };

        unsafe {
            // The block's free space can be too fragmented; a fresh block
            // always has a node that fits.
            let node = loop {
                if let Some(node) = Self::find_free_node(block, needed) {
                    break node;
                }
                block = self.prepend_block(requested);
            };

            Self::split(node, needed);
            (*node).is_free = false;
            (*block.as_ptr()).occupied += (*node).size;

            NonNull::new_unchecked((node as *mut u8).add(NODE_HEADER_SIZE))
        }
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

        let old_payload = self.node_size(ptr) - NODE_HEADER_SIZE;
        let new_ptr = self.alloc(count, elem_size);
        let new_payload = self.node_size(new_ptr) - NODE_HEADER_SIZE;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_payload.min(new_payload));
        self.free(ptr);

        new_ptr
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let block = match self.block_of(ptr.as_ptr().wrapping_sub(NODE_HEADER_SIZE)) {
            Some(block) => block,
            None => panic!("[Buddy]: bad pointer {:?}", ptr),
        };

        let node = &mut *node_of(ptr);
        assert!(!node.is_free, "[Buddy]: double free of {:?}", ptr);
        node.is_free = true;
        (*block.as_ptr()).occupied -= node.size;
    }

    fn free_all(&mut self) {
        self.release_blocks();
    }
}

impl<G: HeapGrower> Drop for Buddy<G> {
    fn drop(&mut self) {
        self.release_blocks();
    }
}

impl<G: HeapGrower> fmt::Display for Buddy<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buddy(")?;
        for (i, block) in self.iter_blocks().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            unsafe {
                let mem = BuddyBlock::mem(block);
                let end = mem.add((*block.as_ptr()).size);
                write!(f, "Block[")?;
                let mut it = mem;
                while it < end {
                    let node = &*(it as *const BuddyNode);
                    write!(f, "{}{}", if it == mem { "" } else { " " }, node.size)?;
                    if !node.is_free {
                        write!(f, "*")?;
                    }
                    it = it.add(node.size);
                }
                write!(f, "]")?;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_block_size_rounding() {
        assert_eq!(Buddy::new(1000).block_size(), 1024);
        assert_eq!(Buddy::new(128).block_size(), 128);
        assert_eq!(Buddy::default().block_size(), SIZE_8K);
    }

    #[test]
    #[should_panic(expected = "[Buddy]: block size 64 is below the minimum")]
    fn test_tiny_block_is_fatal() {
        Buddy::new(64);
    }

    #[test]
    fn test_split_exactness() {
        let mut buddy = Buddy::new(1024);

        let p = buddy.alloc(100, 1);
        // 100 + 16 rounds up to 128.
        assert_eq!(unsafe { buddy.node_size(p) }, 128);
        assert_eq!(buddy.stats().occupied, 128);
        assert_eq!(buddy.to_string(), "Buddy(Block[128* 128 256 512])");

        // The neighbour is the buddy of the first node.
        let q = buddy.alloc(100, 1);
        assert_eq!(q.as_ptr(), unsafe { p.as_ptr().add(128) });

        unsafe { buddy.free(p) };
        let again = buddy.alloc(90, 1);
        assert_eq!(again, p);
        assert_eq!(buddy.stats().blocks, 1);
    }

    #[test]
    fn test_no_coalescing() {
        let mut buddy = Buddy::new(1024);

        let p = buddy.alloc(100, 1);
        unsafe { buddy.free(p) };
        assert_eq!(buddy.stats().occupied, 0);
        assert_eq!(buddy.to_string(), "Buddy(Block[128 128 256 512])");

        // The split nodes stay split: 500 + 16 no longer fits the first block.
        let big = buddy.alloc(500, 1);
        assert_eq!(buddy.stats().blocks, 2);
        assert_eq!(unsafe { buddy.node_size(big) }, 1024);
    }

    #[test]
    fn test_header_only_nodes() {
        let mut buddy = Buddy::new(128);
        let ptrs: Vec<_> = (0..8).map(|_| buddy.alloc(0, 1)).collect();
        assert_eq!(buddy.stats().blocks, 1);
        assert_eq!(buddy.stats().occupied, 128);
        assert!(ptrs.iter().all(|&p| unsafe { buddy.node_size(p) } == 16));

        // The last payload pointer sits on the end of the block.
        for p in ptrs {
            unsafe { buddy.free(p) };
        }
        assert_eq!(buddy.stats().occupied, 0);
        assert_eq!(buddy.stats().blocks, 1);
    }

    #[test]
    fn test_large_request_grows_double() {
        let mut buddy = Buddy::new(1024);
        let p = buddy.alloc(3000, 1);
        assert_eq!(buddy.stats().capacity, 8192);
        assert_eq!(unsafe { buddy.node_size(p) }, 4096);
    }

    #[test]
    fn test_growth_keeps_values() {
        let mut buddy = Buddy::new(256);
        let ptrs: Vec<_> = (0..64u64)
            .map(|i| {
                let p = buddy.alloc(3, 8);
                unsafe { ptr::write_bytes(p.as_ptr(), i as u8, 24) };
                p
            })
            .collect();

        assert!(buddy.stats().blocks > 1);
        for (i, p) in ptrs.iter().enumerate() {
            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 24) };
            assert!(bytes.iter().all(|&b| b == i as u8));
            assert_eq!(unsafe { buddy.node_size(*p) }, 64);
        }

        buddy.free_all();
        assert_eq!(buddy.stats(), Stats::default());
        assert_eq!(buddy.grower.bytes, 0);
    }

    #[test]
    fn test_realloc_copies() {
        let mut buddy = Buddy::new(1024);
        let p = buddy.alloc(16, 1);
        unsafe {
            ptr::write_bytes(p.as_ptr(), 7, 16);
            let q = buddy.realloc(Some(p), 200, 1);
            assert_ne!(p, q);
            let bytes = core::slice::from_raw_parts(q.as_ptr(), 16);
            assert_eq!(bytes, &[7; 16]);
            assert_eq!(buddy.stats().occupied, buddy.node_size(q));
        }
    }

    #[test]
    #[should_panic(expected = "[Buddy]: double free")]
    fn test_double_free_is_fatal() {
        let mut buddy = Buddy::new(1024);
        let p = buddy.alloc(10, 1);
        unsafe {
            buddy.free(p);
            buddy.free(p);
        }
    }

    #[test]
    #[should_panic(expected = "[Buddy]: bad pointer")]
    fn test_foreign_pointer_is_fatal() {
        let mut buddy = Buddy::new(1024);
        let mut other = Buddy::new(1024);
        buddy.alloc(10, 1);
        let foreign = other.alloc(10, 1);
        unsafe { buddy.free(foreign) };
    }
}

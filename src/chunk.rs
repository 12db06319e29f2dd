//! A slab allocator serving cells of one fixed size.
//!
//! Each block is cut into equal cells when it is created, and the unused
//! cells of a block are threaded into a free list through a `next` pointer
//! stored in each cell's header. Allocation and free are O(1) apart from the
//! scan for the owning block.
//!
//! `realloc` is not supported: every cell has the same size.

use core::mem::size_of;
use core::ptr::{self, NonNull};

use static_assertions::const_assert;

use crate::allocators::{align8, grow_or_die, Allocator, HeapGrower, Stats, SystemHeap, ALIGN};

/// Header of a cell. While the cell is handed out, only the payload after
/// it is touched.
#[repr(C)]
struct ChunkNode {
    next: Option<NonNull<ChunkNode>>,
}

const NODE_HEADER_SIZE: usize = size_of::<ChunkNode>();
const_assert!(NODE_HEADER_SIZE % ALIGN == 0);

#[repr(C, align(16))]
struct ChunkBlock {
    next: Option<NonNull<ChunkBlock>>,
    head: Option<NonNull<ChunkNode>>,
    /// Bytes of cells currently handed out.
    used: usize,
}

const BLOCK_HEADER_SIZE: usize = size_of::<ChunkBlock>();

impl ChunkBlock {
    unsafe fn mem(block: NonNull<ChunkBlock>) -> *mut u8 {
        (block.as_ptr() as *mut u8).add(BLOCK_HEADER_SIZE)
    }
}

pub struct ChunkAllocator<G: HeapGrower = SystemHeap> {
    pub grower: G,
    /// Bytes of cells per block; a multiple of `chunk_size`.
    block_cap: usize,
    /// Cell size, header included.
    chunk_size: usize,
    blocks: Option<NonNull<ChunkBlock>>,
}

unsafe impl<G: HeapGrower + Send> Send for ChunkAllocator<G> {}

impl ChunkAllocator<SystemHeap> {
    /// Cells of `chunk_size` usable bytes, about `block_size` bytes of cells
    /// per block.
    pub fn new(chunk_size: usize, block_size: usize) -> Self {
        Self::with_grower(chunk_size, block_size, SystemHeap::new())
    }
}

impl<G: HeapGrower> ChunkAllocator<G> {
    /// Bytes a cell of `chunk_size` usable bytes takes up in a block, header
    /// included.
    pub const fn cell_size(chunk_size: usize) -> usize {
        align8(chunk_size) + NODE_HEADER_SIZE
    }

    pub fn with_grower(chunk_size: usize, block_size: usize, grower: G) -> Self {
        let chunk_size = Self::cell_size(chunk_size);
        // At least one cell per block.
        let block_cap = (block_size.max(chunk_size) + chunk_size - 1) / chunk_size * chunk_size;
        ChunkAllocator {
            grower,
            block_cap,
            chunk_size,
            blocks: None,
        }
    }

    /// Usable bytes of a cell.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size - NODE_HEADER_SIZE
    }

    /// Cells cut from each block.
    pub fn chunks_per_block(&self) -> usize {
        self.block_cap / self.chunk_size
    }

    fn iter_blocks(&self) -> impl Iterator<Item = NonNull<ChunkBlock>> + '_ {
        let mut next = self.blocks;
        core::iter::from_fn(move || {
            let block = next?;
            next = unsafe { (*block.as_ptr()).next };
            Some(block)
        })
    }

    fn new_block(&mut self) -> NonNull<ChunkBlock> {
        let raw = grow_or_die(&mut self.grower, BLOCK_HEADER_SIZE + self.block_cap);
        let block: NonNull<ChunkBlock> = raw.cast();

        unsafe {
            let mem = ChunkBlock::mem(block);
            let chunks = self.block_cap / self.chunk_size;

            // Thread every cell onto the free list, front to back.
            for i in 0..chunks {
                let node = mem.add(i * self.chunk_size) as *mut ChunkNode;
                let next = if i + 1 < chunks {
                    NonNull::new(mem.add((i + 1) * self.chunk_size) as *mut ChunkNode)
                } else {
                    None
                };
                node.write(ChunkNode { next });
            }

            block.as_ptr().write(ChunkBlock {
                next: None,
                head: NonNull::new(mem as *mut ChunkNode),
                used: 0,
            });
        }

        log::debug!(
            "[ChunkAllocator]: new block of {} cells of {} bytes",
            self.block_cap / self.chunk_size,
            self.chunk_size
        );
        block
    }

    /// The first block with a free cell, appending a new block at the end of
    /// the chain if every block is full.
    fn block_with_room(&mut self) -> NonNull<ChunkBlock> {
        let mut last = None;
        for block in self.iter_blocks() {
            if unsafe { self.block_cap - (*block.as_ptr()).used >= self.chunk_size } {
                return block;
            }
            last = Some(block);
        }

        let block = self.new_block();
        match last {
            None => self.blocks = Some(block),
            Some(last) => unsafe { (*last.as_ptr()).next = Some(block) },
        }
        block
    }

    fn block_of(&self, ptr: *const u8) -> Option<NonNull<ChunkBlock>> {
        self.iter_blocks().find(|&block| unsafe {
            let start = ChunkBlock::mem(block) as *const u8;
            ptr > start && ptr < start.add(self.block_cap)
        })
    }

    pub fn stats(&self) -> Stats {
        self.iter_blocks().fold(Stats::default(), |mut stats, block| {
            stats.blocks += 1;
            stats.capacity += self.block_cap;
            stats.occupied += unsafe { (*block.as_ptr()).used };
            stats
        })
    }

    fn release_blocks(&mut self) {
        let mut next = self.blocks.take();
        while let Some(block) = next {
            unsafe {
                next = (*block.as_ptr()).next;
                self.grower
                    .release(block.cast(), BLOCK_HEADER_SIZE + self.block_cap);
            }
        }
    }
}

impl<G: HeapGrower> Allocator for ChunkAllocator<G> {
    /// Hand out one cell. The size arguments are ignored.
    fn alloc(&mut self, _count: usize, _elem_size: usize) -> NonNull<u8> {
        let block = self.block_with_room();

        unsafe {
            let header = &mut *block.as_ptr();
            let node = match header.head {
                Some(node) => node,
                None => panic!("[ChunkAllocator]: block accounting is corrupt"),
            };
            header.head = (*node.as_ptr()).next;
            header.used += self.chunk_size;

            NonNull::new_unchecked((node.as_ptr() as *mut u8).add(NODE_HEADER_SIZE))
        }
    }

    fn zalloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        let ptr = self.alloc(count, elem_size);
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, self.chunk_size()) };
        ptr
    }

    unsafe fn realloc(
        &mut self,
        _ptr: Option<NonNull<u8>>,
        _count: usize,
        _elem_size: usize,
    ) -> NonNull<u8> {
        panic!("[ChunkAllocator]: can't realloc()");
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let block = match self.block_of(ptr.as_ptr()) {
            Some(block) => block,
            None => panic!("[ChunkAllocator]: bad pointer {:?}", ptr),
        };

        let node = ptr.as_ptr().sub(NODE_HEADER_SIZE) as *mut ChunkNode;
        let header = &mut *block.as_ptr();
        debug_assert!(header.used >= self.chunk_size, "[ChunkAllocator]: double free");
        #[cfg(debug_assertions)]
        {
            let mut it = header.head;
            while let Some(free) = it {
                assert!(
                    free.as_ptr() != node,
                    "[ChunkAllocator]: double free of {:?}",
                    ptr
                );
                it = (*free.as_ptr()).next;
            }
        }

        (*node).next = header.head;
        header.head = NonNull::new(node);
        header.used -= self.chunk_size;
    }

    fn free_all(&mut self) {
        self.release_blocks();
    }
}

impl<G: HeapGrower> Drop for ChunkAllocator<G> {
    fn drop(&mut self) {
        self.release_blocks();
    }
}

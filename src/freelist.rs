//! A best-fit allocator with coalescing.
//!
//! Each block is carved into an address-ordered, doubly-linked chain of
//! nodes. A node is a [`RbNode`] header followed by its payload; free nodes
//! are additionally indexed by size in a red-black tree, which makes finding
//! a fitting node O(log n). Freed nodes are merged with free neighbours in the
//! chain before going back into the tree.
//!
//! ## Layout
//!
//! ```text
//! | FreeListBlock | node | payload ... | node | payload ... | node | ...
//!                 ^ chain start         (prev/next link address order)
//! ```
//!
//! When a free node is split, the allocation is taken from its tail so the
//! free head stays put and only needs re-inserting with its new size.

use core::cmp::Ordering;
use core::fmt;
use core::mem::size_of;
use core::ops::ControlFlow;
use core::ptr::{self, NonNull};

use static_assertions::const_assert;

use crate::allocators::{
    align8, grow_or_die, request_size, Allocator, HeapGrower, Stats, SystemHeap, ALIGN,
    BLOCK_ALIGN, SIZE_8K,
};
use crate::rbtree::{Order, RbNode, RbTree, TreeValidity};

struct FreeListData {
    /// Previous node in address order, within the same block.
    prev: Option<NonNull<Node>>,
    next: Option<NonNull<Node>>,
    /// Size of the node, header included.
    size: usize,
    is_free: bool,
}

type Node = RbNode<FreeListData>;

const NODE_HEADER_SIZE: usize = size_of::<Node>();
const_assert!(NODE_HEADER_SIZE % ALIGN == 0);

fn by_size(a: &FreeListData, b: &FreeListData) -> Ordering {
    a.size.cmp(&b.size)
}

#[repr(C, align(16))]
struct FreeListBlock {
    next: Option<NonNull<FreeListBlock>>,
    /// Bytes of nodes after the header.
    size: usize,
    /// Total size of the occupied nodes, headers included.
    occupied: usize,
}

const BLOCK_HEADER_SIZE: usize = size_of::<FreeListBlock>();
const_assert!(BLOCK_HEADER_SIZE % BLOCK_ALIGN == 0);

impl FreeListBlock {
    unsafe fn mem(block: NonNull<FreeListBlock>) -> *mut u8 {
        (block.as_ptr() as *mut u8).add(BLOCK_HEADER_SIZE)
    }
}

unsafe fn node_of(ptr: NonNull<u8>) -> NonNull<Node> {
    NonNull::new_unchecked(ptr.as_ptr().sub(NODE_HEADER_SIZE)).cast()
}

unsafe fn payload_of(node: NonNull<Node>) -> NonNull<u8> {
    NonNull::new_unchecked((node.as_ptr() as *mut u8).add(NODE_HEADER_SIZE))
}

pub struct FreeList<G: HeapGrower = SystemHeap> {
    pub grower: G,
    block_size: usize,
    blocks: Option<NonNull<FreeListBlock>>,
    /// Every free node, keyed by size.
    tree: RbTree<FreeListData>,
}

unsafe impl<G: HeapGrower + Send> Send for FreeList<G> {}

impl FreeList<SystemHeap> {
    /// New blocks hold at least `block_size` bytes of nodes.
    pub fn new(block_size: usize) -> Self {
        Self::with_grower(block_size, SystemHeap::new())
    }
}

impl Default for FreeList<SystemHeap> {
    fn default() -> Self {
        Self::new(SIZE_8K)
    }
}

impl<G: HeapGrower> FreeList<G> {
    pub fn with_grower(block_size: usize, grower: G) -> Self {
        FreeList {
            grower,
            block_size: align8(block_size),
            blocks: None,
            tree: RbTree::new(by_size),
        }
    }

    /// Bytes of bookkeeping in front of every allocation.
    pub const fn node_header_size() -> usize {
        NODE_HEADER_SIZE
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of free nodes.
    pub fn free_nodes(&self) -> usize {
        self.tree.len()
    }

    fn iter_blocks(&self) -> impl Iterator<Item = NonNull<FreeListBlock>> + '_ {
        let mut next = self.blocks;
        core::iter::from_fn(move || {
            let block = next?;
            next = unsafe { (*block.as_ptr()).next };
            Some(block)
        })
    }

    fn block_of(&self, ptr: *const u8) -> Option<NonNull<FreeListBlock>> {
        self.iter_blocks().find(|&block| unsafe {
            let start = FreeListBlock::mem(block) as *const u8;
            ptr > start && ptr < start.add((*block.as_ptr()).size)
        })
    }

    /// Add a block for a request of `requested` payload bytes. The whole
    /// block starts out as one free node.
    fn new_block(&mut self, requested: usize) {
        let size = self
            .block_size
            .max(2 * requested + NODE_HEADER_SIZE);
        let raw = grow_or_die(&mut self.grower, BLOCK_HEADER_SIZE + size);
        let block: NonNull<FreeListBlock> = raw.cast();

        unsafe {
            block.as_ptr().write(FreeListBlock {
                next: self.blocks,
                size,
                occupied: 0,
            });
            let node: NonNull<Node> = NonNull::new_unchecked(FreeListBlock::mem(block)).cast();
            node.as_ptr().write(RbNode::new(FreeListData {
                prev: None,
                next: None,
                size,
                is_free: true,
            }));
            self.tree.insert(node, true);
        }

        self.blocks = Some(block);
        log::debug!("[FreeList]: new block of {} bytes at {:?}", size, block);
    }

    /// Descend the tree towards `size`, keeping the last node on the path
    /// that is big enough.
    ///
    /// This is not a global best fit: a smaller fitting node off the search
    /// path is not considered.
    fn find_fitting(&self, size: usize) -> Option<NonNull<Node>> {
        let mut fitting = None;
        let mut it = self.tree.root();
        while let Some(node) = it {
            let node_ref = unsafe { node.as_ref() };
            let node_size = node_ref.data.size;
            if node_size >= size {
                fitting = Some(node);
            }
            it = match size.cmp(&node_size) {
                Ordering::Equal => break,
                Ordering::Less => node_ref.left(),
                Ordering::Greater => node_ref.right(),
            };
        }
        fitting
    }

    /// Take `real_size` bytes out of the free `node`, returning the occupied
    /// node.
    unsafe fn carve(&mut self, node: NonNull<Node>, real_size: usize) -> NonNull<Node> {
        self.tree.remove(node);
        let data = &mut (*node.as_ptr()).data;

        let split = data.size - real_size;
        if split <= NODE_HEADER_SIZE {
            // No room for another node: hand over the whole thing.
            data.is_free = false;
            return node;
        }

        let tail: NonNull<Node> =
            NonNull::new_unchecked((node.as_ptr() as *mut u8).add(split)).cast();
        tail.as_ptr().write(RbNode::new(FreeListData {
            prev: Some(node),
            next: data.next,
            size: real_size,
            is_free: false,
        }));
        if let Some(next) = data.next {
            (*next.as_ptr()).data.prev = Some(tail);
        }
        data.next = Some(tail);
        data.size = split;

        self.tree.insert(node, true);
        tail
    }

    /// Unlink `next` from the chain and fold it into `node`. `next` must
    /// directly follow `node`; neither may be in the tree.
    unsafe fn absorb(node: NonNull<Node>, next: NonNull<Node>) {
        let next = &(*next.as_ptr()).data;
        let data = &mut (*node.as_ptr()).data;
        data.size += next.size;
        data.next = next.next;
        if let Some(after) = data.next {
            (*after.as_ptr()).data.prev = Some(node);
        }
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

    fn trace_tree(&self) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        let mut drawn = String::new();
        let result = self.tree.fmt_tree(&mut drawn, |out, node| {
            use core::fmt::Write;
            write!(out, "{:?} ({})", node as *const Node, node.data.size)
        });
        if result.is_ok() {
            log::trace!("[FreeList]: free tree\n{}", drawn);
        }
    }

    /// Walk every block chain and the free tree, counting everything that
    /// breaks the bookkeeping.
    pub fn validate(&self) -> Validity {
        let mut validity = Validity {
            tree: self.tree.validate(),
            ..Default::default()
        };

        let mut tree_nodes: Vec<*const Node> = Vec::with_capacity(self.tree.len());
        self.tree.traverse(Order::In, |_, node| {
            if !node.data.is_free {
                validity.stray_tree_nodes += 1;
            }
            tree_nodes.push(node);
            ControlFlow::Continue(())
        });
        tree_nodes.sort_unstable();

        let mut chain_free: Vec<*const Node> = Vec::new();
        for block in self.iter_blocks() {
            unsafe {
                let mem = FreeListBlock::mem(block) as *const u8;
                let end = mem.add((*block.as_ptr()).size);
                let mut expected = mem;
                let mut prev: Option<NonNull<Node>> = None;
                let mut occupied = 0;

                let mut cur = NonNull::new(mem as *mut Node);
                while let Some(node) = cur {
                    let addr = node.as_ptr() as *const u8;
                    if addr != expected {
                        validity.gaps += 1;
                    }
                    if addr < mem || addr >= end {
                        break;
                    }

                    let data = &(*node.as_ptr()).data;
                    if data.prev != prev {
                        validity.broken_links += 1;
                    }
                    if data.is_free {
                        chain_free.push(node.as_ptr());
                        if prev.map_or(false, |p| (*p.as_ptr()).data.is_free) {
                            validity.uncoalesced += 1;
                        }
                    } else {
                        occupied += data.size;
                    }

                    expected = addr.add(data.size);
                    prev = Some(node);
                    cur = data.next;
                    if cur.map_or(false, |next| next.as_ptr() as *const u8 <= addr) {
                        // Going backwards would never end.
                        validity.broken_links += 1;
                        break;
                    }
                }

                if expected != end {
                    validity.gaps += 1;
                }
                if occupied != (*block.as_ptr()).occupied {
                    validity.occupancy_mismatches += 1;
                }
            }
        }
        chain_free.sort_unstable();

        validity.untracked_free += chain_free
            .iter()
            .filter(|node| tree_nodes.binary_search(node).is_err())
            .count();
        validity.stray_tree_nodes += tree_nodes
            .iter()
            .filter(|node| chain_free.binary_search(node).is_err())
            .count();

        validity
    }

    fn release_blocks(&mut self) {
        self.tree.clear();
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

/// Allocation size for a request: aligned, at least one word.
fn payload_size(count: usize, elem_size: usize) -> usize {
    align8(request_size(count, elem_size)).max(ALIGN)
}

impl<G: HeapGrower> Allocator for FreeList<G> {
    fn alloc(&mut self, count: usize, elem_size: usize) -> NonNull<u8> {
        let requested = payload_size(count, elem_size);
        let real_size = requested + NODE_HEADER_SIZE;

        let has_room = self.iter_blocks().any(|block| unsafe {
            let block = &*block.as_ptr();
            block.size - block.occupied >= real_size
        });
        if !has_room {
            self.new_block(requested);
        }

        unsafe {
            // Free space may be spread over nodes too small to use; a fresh
            // block always fits.
            let node = loop {
                if let Some(node) = self.find_fitting(real_size) {
                    break node;
                }
                self.new_block(requested);
            };

            let node = self.carve(node, real_size);
            let size = (*node.as_ptr()).data.size;
            let payload = payload_of(node);
            match self.block_of(payload.as_ptr()) {
                Some(block) => (*block.as_ptr()).occupied += size,
                None => panic!("[FreeList]: carved node {:?} outside every block", node),
            }

            log::trace!("[FreeList]: alloc {} bytes at {:?}", size, payload);
            payload
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

        let node_size = (*node_of(ptr).as_ptr()).data.size;
        if node_size >= payload_size(count, elem_size) + NODE_HEADER_SIZE {
            return ptr;
        }

        let new_ptr = self.alloc(count, elem_size);
        ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new_ptr.as_ptr(),
            node_size - NODE_HEADER_SIZE,
        );
        self.free(ptr);
        new_ptr
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let block = match self.block_of(ptr.as_ptr()) {
            Some(block) => block,
            None => panic!("[FreeList]: bad pointer {:?}", ptr),
        };

        let mut node = node_of(ptr);
        {
            let data = &mut (*node.as_ptr()).data;
            assert!(!data.is_free, "[FreeList]: double free of {:?}", ptr);
            data.is_free = true;
            (*block.as_ptr()).occupied -= data.size;
        }

        if let Some(next) = (*node.as_ptr()).data.next {
            if (*next.as_ptr()).data.is_free {
                self.tree.remove(next);
                Self::absorb(node, next);
            }
        }
        if let Some(prev) = (*node.as_ptr()).data.prev {
            if (*prev.as_ptr()).data.is_free {
                self.tree.remove(prev);
                Self::absorb(prev, node);
                node = prev;
            }
        }

        self.tree.insert(node, true);
        log::trace!(
            "[FreeList]: freed {:?}, free node now {} bytes",
            ptr,
            (*node.as_ptr()).data.size
        );
        self.trace_tree();
    }

    fn free_all(&mut self) {
        self.release_blocks();
    }
}

impl<G: HeapGrower> Drop for FreeList<G> {
    fn drop(&mut self) {
        self.release_blocks();
    }
}

/// Validity counts every broken piece of bookkeeping found in a FreeList.
#[derive(Default, Debug)]
pub struct Validity {
    /// Places where a chain doesn't tile its block exactly.
    pub gaps: usize,
    /// Nodes whose `prev` doesn't point at the node before them.
    pub broken_links: usize,
    /// Free nodes directly after another free node.
    ///
    /// These should have been merged.
    pub uncoalesced: usize,
    /// Free nodes in a chain that are missing from the tree.
    pub untracked_free: usize,
    /// Tree entries that aren't free nodes of any chain.
    pub stray_tree_nodes: usize,
    /// Blocks whose occupancy doesn't match their occupied nodes.
    pub occupancy_mismatches: usize,
    pub tree: TreeValidity,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.gaps == 0
            && self.broken_links == 0
            && self.uncoalesced == 0
            && self.untracked_free == 0
            && self.stray_tree_nodes == 0
            && self.occupancy_mismatches == 0
            && self.tree.is_valid()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

impl<G: HeapGrower> fmt::Display for FreeList<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeList(")?;
        for (i, block) in self.iter_blocks().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            unsafe {
                let header = &*block.as_ptr();
                write!(f, "Block[{}/{}:", header.occupied, header.size)?;
                let mut cur = NonNull::new(FreeListBlock::mem(block) as *mut Node);
                while let Some(node) = cur {
                    let data = &(*node.as_ptr()).data;
                    write!(f, " {}{}", data.size, if data.is_free { "" } else { "*" })?;
                    cur = data.next;
                }
                write!(f, "]")?;
            }
        }
        write!(f, ")")
    }
}

//! Block-based memory allocators behind one allocation contract.
//!
//! Every strategy implements [`Allocator`] and takes its blocks from a
//! [`HeapGrower`]:
//!
//! - [`Arena`]: bump allocation over a chain of blocks, freed all at once.
//! - [`FixedAllocator`]: bump allocation over a caller-supplied buffer.
//! - [`ChunkAllocator`]: equal-sized cells with O(1) alloc and free.
//! - [`Buddy`]: power-of-two nodes split on demand.
//! - [`FreeList`]: best-fit over a size-indexed [`RbTree`], with coalescing.
//! - [`MutexArena`]: an `Arena` that can be shared between threads, or used
//!   as a `#[global_allocator]`.
//! - [`OsAllocator`]: hands each request straight to the grower.
//!
//! [`AllocatorPool`] keeps many allocator instances in chunk cells.

pub mod allocators;
pub mod arena;
pub mod buddy;
pub mod chunk;
pub mod fixed;
pub mod freelist;
pub mod mutex_arena;
pub mod pool;
pub mod rbtree;

#[cfg(feature = "use_libc")]
pub use allocators::LibcHeap;
pub use allocators::{
    align8, round_up, Allocator, HeapGrower, OsAllocator, Stats, SystemHeap, SystemHeapError,
    ALIGN, BLOCK_ALIGN, SIZE_1G, SIZE_1K, SIZE_1M, SIZE_8K, SIZE_8M, SIZE_MIN,
};
pub use arena::Arena;
pub use buddy::Buddy;
pub use chunk::ChunkAllocator;
pub use fixed::FixedAllocator;
pub use freelist::{FreeList, Validity};
pub use mutex_arena::MutexArena;
pub use pool::AllocatorPool;
pub use rbtree::{RbNode, RbTree};

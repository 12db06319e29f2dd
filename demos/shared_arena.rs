//! Uses a MutexArena as the global allocator of a small multi-threaded
//! program. Nothing is ever given back; the arena just keeps growing.

use std::thread;

use blockalloc::{MutexArena, SIZE_1M};

#[global_allocator]
static ARENA: MutexArena = MutexArena::new(SIZE_1M);

fn main() {
    let threads: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);

    let sums: Vec<u64> = (0..threads as u64)
        .map(|t| {
            thread::spawn(move || {
                let words: Vec<String> = (0..10_000).map(|i| format!("{}-{}", t, i)).collect();
                words.iter().map(|w| w.len() as u64).sum()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap_or(0))
        .collect();

    let stats = ARENA.stats();
    println!("Lengths per thread: {:?}", sums);
    println!(
        "Arena: {} blocks, {} of {} bytes used",
        stats.blocks, stats.occupied, stats.capacity
    );
}

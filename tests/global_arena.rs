//! Runs with a `MutexArena` as the global allocator, so the test harness,
//! the std collections and the logger all allocate from it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use blockalloc::{MutexArena, SIZE_1K};

#[global_allocator]
static ARENA: MutexArena = MutexArena::new(4 * SIZE_1K);

static NEW_BLOCKS: AtomicUsize = AtomicUsize::new(0);

/// Formats every record into a fresh `String`, so each log call allocates
/// from the arena. `test_log` is not used here since it would install its
/// own logger.
struct FormattingLogger;

impl log::Log for FormattingLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let line = format!("{} {}", record.level(), record.args());
        if line.contains("[Arena]: new block") {
            NEW_BLOCKS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flush(&self) {}
}

static LOGGER: FormattingLogger = FormattingLogger;

fn install_logger() {
    // Tests race to install it; only the first call succeeds.
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Debug);
}

#[test]
fn test_growth_with_allocating_logger() {
    install_logger();
    let before = ARENA.stats().blocks;

    let v = vec![1u8; 100_000];
    assert!(v.iter().all(|&b| b == 1));

    assert!(ARENA.stats().blocks > before);
    assert!(NEW_BLOCKS.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_hash_map() {
    install_logger();
    let mut map: HashMap<u64, String> = HashMap::new();
    for i in 0..1000u64 {
        map.insert(i, i.to_string());
    }
    assert_eq!(map.len(), 1000);
    assert!((0..1000u64).all(|i| map[&i] == i.to_string()));

    let mut words: Vec<&String> = map.values().collect();
    words.sort();
    assert_eq!(words[0], "0");
}

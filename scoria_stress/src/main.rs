//! Randomized stress driver for the scoria heap
//!
//! Hammers one shared heap from several threads with a mixed small / large /
//! huge workload, verifying block integrity through a per-allocation byte
//! tag, then reports throughput and the RSS cost of the run.
//!
//! ```text
//! scoria_stress [ITERATIONS] [THREADS] [SEED]
//! ```

use std::{error::Error, fmt::Display, num::ParseIntError, time::Instant};

use memory_stats::memory_stats;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use tracing_subscriber::filter::EnvFilter;

use scoria_heap::{ThreadHeap, HUGE_OBJECT_THRESHOLD, MAX_SMALL_OBJECT_SIZE, PAGE_SIZE};

#[derive(Debug)]
enum StressError {
    BadArgument(ParseIntError),
    WorkerPanicked,
}

impl Display for StressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StressError::BadArgument(e) => write!(f, "bad argument: {}", e),
            StressError::WorkerPanicked => write!(f, "worker thread panicked"),
        }
    }
}

impl Error for StressError {}

impl From<ParseIntError> for StressError {
    fn from(value: ParseIntError) -> Self {
        Self::BadArgument(value)
    }
}

/// One worker's slice of the workload: random allocs and frees against the
/// shared heap, with every block tagged and checked before release
fn worker(heap: &ThreadHeap, iterations: usize, seed: u64) {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let mut live: Vec<(usize, usize, u8)> = Vec::new();

    // the live set is capped so long runs stay within a bounded footprint
    let max_live = 4096;

    for _ in 0..iterations {
        let do_alloc = live.is_empty() || (live.len() < max_live && rng.gen::<bool>());
        if do_alloc {
            let size = match rng.gen_range(0..1000) {
                0..=799 => rng.gen_range(1..=1024),
                800..=989 => rng.gen_range(1024..=MAX_SMALL_OBJECT_SIZE),
                990..=998 => rng.gen_range(MAX_SMALL_OBJECT_SIZE + 1..=HUGE_OBJECT_THRESHOLD),
                _ => rng.gen_range(HUGE_OBJECT_THRESHOLD + 1..HUGE_OBJECT_THRESHOLD + 8 * PAGE_SIZE),
            };
            let Some(ptr) = heap.allocate(size) else {
                panic!("allocation of {} bytes failed", size);
            };
            let ptr = ptr.as_ptr();
            let tag = rng.gen::<u8>();
            unsafe {
                for i in 0..size.min(16) {
                    ptr.add(i).write(tag);
                }
                ptr.add(size - 1).write(tag);
            }
            live.push((ptr as usize, size, tag));
        } else {
            let victim = rng.gen_range(0..live.len());
            let (addr, size, tag) = live.swap_remove(victim);
            let ptr = addr as *mut u8;
            unsafe {
                for i in 0..size.min(16) {
                    assert_eq!(ptr.add(i).read(), tag, "block was clobbered");
                }
                assert_eq!(ptr.add(size - 1).read(), tag, "block tail was clobbered");
            }
            heap.free(ptr);
        }
    }

    for (addr, _, _) in live {
        heap.free(addr as *mut u8);
    }
}

fn main() -> Result<(), StressError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = std::env::args().collect::<Vec<_>>();
    let iterations: usize = args.get(1).map(|a| a.parse()).transpose()?.unwrap_or(1_000_000);
    let threads: usize = args
        .get(2)
        .map(|a| a.parse())
        .transpose()?
        .unwrap_or(2)
        .max(1);
    let seed: u64 = args.get(3).map(|a| a.parse()).transpose()?.unwrap_or(0);

    println!(
        "{} iterations across {} threads, seed {}",
        iterations, threads, seed
    );

    let heap = ThreadHeap::new();
    let start_mem = memory_stats();
    let start = Instant::now();

    let mut failed = false;
    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for tid in 0..threads {
            let heap = &heap;
            let per_thread = iterations / threads;
            handles.push(scope.spawn(move || worker(heap, per_thread, seed ^ ((tid as u64) << 32))));
        }
        for handle in handles {
            if handle.join().is_err() {
                failed = true;
            }
        }
    });
    if failed {
        return Err(StressError::WorkerPanicked);
    }

    let elapsed = start.elapsed();
    heap._debug_validate();

    println!(
        "{} ops in {:?} ({:.0} ops/sec)",
        iterations,
        elapsed,
        iterations as f64 / elapsed.as_secs_f64()
    );
    if let (Some(before), Some(after)) = (start_mem, memory_stats()) {
        println!(
            "physical memory grew by {:.1} MB",
            (after.physical_mem.saturating_sub(before.physical_mem)) as f64 / 1024.0 / 1024.0
        );
    }

    Ok(())
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use sisal::{DispatcherBuilder, JobDesc, JobPriority};

const DISPATCHERS: usize = 4;
const BATCHES_PER_THREAD: usize = 50;

// Several plain threads dispatching and waiting concurrently, with mixed
// priorities and batch sizes. The invocation count must equal the sum of
// what actually got scheduled, and every pool must end up fully recycled.
#[test]
fn concurrent_batches_from_many_threads() {
    DispatcherBuilder::new()
        .num_threads(3)
        .thread_name("stress")
        .build_global()
        .unwrap();

    let total = Arc::new(AtomicUsize::new(0));
    let expected = Arc::new(AtomicUsize::new(0));

    let threads: Vec<_> = (0..DISPATCHERS as u64)
        .map(|seed| {
            let total = Arc::clone(&total);
            let expected = Arc::clone(&expected);
            thread::spawn(move || {
                let mut rng = XorShiftRng::seed_from_u64(0x51a1 + seed);
                for _ in 0..BATCHES_PER_THREAD {
                    let batch_size = rng.gen_range(1..16);
                    let jobs: Vec<_> = (0..batch_size)
                        .map(|_| {
                            let priority = match rng.gen_range(0..3) {
                                0 => JobPriority::High,
                                1 => JobPriority::Normal,
                                _ => JobPriority::Low,
                            };
                            let total = Arc::clone(&total);
                            JobDesc::with_priority(priority, move |_| {
                                total.fetch_add(1, Ordering::SeqCst);
                            })
                        })
                        .collect();
                    let handle = sisal::dispatch_small(jobs).unwrap();
                    expected.fetch_add(handle.scheduled(), Ordering::SeqCst);
                    sisal::wait_jobs(handle);
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(total.load(Ordering::SeqCst), expected.load(Ordering::SeqCst));

    let stats = sisal::stats();
    assert_eq!(stats.small_free, stats.small_capacity);
    assert_eq!(stats.big_free, stats.big_capacity);
    assert_eq!(stats.counters_free, stats.counters_capacity);

    sisal::shutdown();
}

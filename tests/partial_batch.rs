use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sisal::{DispatcherBuilder, JobDesc};

// Submitting more jobs than the pool holds is legal: the overflow is
// dropped at dispatch and the handle counts only what got a fiber.
#[test]
fn overfull_batch_is_clipped_to_pool_capacity() {
    DispatcherBuilder::new().num_threads(2).build_global().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let jobs: Vec<_> = (0..200)
        .map(|_| {
            let hits = Arc::clone(&hits);
            JobDesc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let handle = sisal::dispatch_small(jobs).unwrap();
    assert_eq!(handle.scheduled(), 128, "small pool holds 128 fibers");

    sisal::wait_jobs(handle);
    assert_eq!(hits.load(Ordering::SeqCst), 128);

    // The 72 skipped jobs are gone for good, not deferred.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 128);

    let stats = sisal::stats();
    assert_eq!(stats.small_free, stats.small_capacity);
    assert_eq!(stats.counters_free, stats.counters_capacity);

    sisal::shutdown();
}

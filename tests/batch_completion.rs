use std::sync::{Arc, Mutex};

use sisal::JobDesc;

#[test]
fn every_job_of_a_batch_runs_exactly_once() {
    sisal::init().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let jobs: Vec<_> = (0..16)
        .map(|_| {
            let seen = Arc::clone(&seen);
            JobDesc::new(move |index| seen.lock().unwrap().push(index))
        })
        .collect();

    let handle = sisal::dispatch_small(jobs).unwrap();
    assert_eq!(handle.scheduled(), 16);
    sisal::wait_jobs(handle);

    let mut seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 16);
    seen.sort_unstable();
    assert_eq!(seen, (0..16).collect::<Vec<_>>(), "indices must be a permutation");

    // Nothing in flight: pools must be fully recycled.
    let stats = sisal::stats();
    assert_eq!(stats.small_free, stats.small_capacity);
    assert_eq!(stats.big_free, stats.big_capacity);
    assert_eq!(stats.counters_free, stats.counters_capacity);

    sisal::shutdown();
}

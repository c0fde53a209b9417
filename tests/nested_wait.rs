use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use sisal::{DispatcherBuilder, JobDesc};

// A job dispatches a child batch and waits on it inline. The child effects
// must be complete before the parent's callback continues, and the parent
// must resume on the thread it was parked on (its auxiliary-stack frames
// live there). Assertions happen outside the callbacks: the dispatcher
// contains job panics, so a failed assert inside one would be swallowed.
#[test]
fn job_waits_for_child_batch_inline() {
    DispatcherBuilder::new()
        .num_threads(2)
        .thread_name("nested")
        .build_global()
        .unwrap();

    let child_hits = Arc::new(AtomicUsize::new(0));
    let children_done_inline = Arc::new(AtomicBool::new(false));
    let resumed_on_same_thread = Arc::new(AtomicBool::new(false));

    let parent = {
        let child_hits = Arc::clone(&child_hits);
        let children_done_inline = Arc::clone(&children_done_inline);
        let resumed_on_same_thread = Arc::clone(&resumed_on_same_thread);
        JobDesc::new(move |_| {
            let before = thread::current().id();

            let children: Vec<_> = (0..8)
                .map(|_| {
                    let child_hits = Arc::clone(&child_hits);
                    JobDesc::new(move |_| {
                        child_hits.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .collect();
            let handle = sisal::dispatch_small(children).unwrap();
            sisal::wait_jobs(handle);

            children_done_inline.store(child_hits.load(Ordering::SeqCst) == 8, Ordering::SeqCst);
            resumed_on_same_thread.store(thread::current().id() == before, Ordering::SeqCst);
        })
    };

    let handle = sisal::dispatch_big(vec![parent]).unwrap();
    assert_eq!(handle.scheduled(), 1);
    sisal::wait_jobs(handle);

    assert_eq!(child_hits.load(Ordering::SeqCst), 8);
    assert!(
        children_done_inline.load(Ordering::SeqCst),
        "child batch had not drained when the parent's wait returned"
    );
    assert!(
        resumed_on_same_thread.load(Ordering::SeqCst),
        "parent resumed on a different thread than it parked on"
    );

    let stats = sisal::stats();
    assert_eq!(stats.small_free, stats.small_capacity);
    assert_eq!(stats.big_free, stats.big_capacity);
    assert_eq!(stats.counters_free, stats.counters_capacity);

    sisal::shutdown();
}

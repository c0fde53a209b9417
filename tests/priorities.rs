use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sisal::{DispatcherBuilder, JobDesc, JobPriority};

// One worker, held at a gate while the batches queue up behind it. Once the
// gate opens the worker must drain every High job before touching a Low one.
// The main thread spins outside the dispatcher until everything ran, so its
// wait cannot steal jobs and muddy the order.
#[test]
fn high_priority_runs_before_low() {
    DispatcherBuilder::new().num_threads(1).build_global().unwrap();

    let release = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let gate = {
        let release = Arc::clone(&release);
        let done = Arc::clone(&done);
        JobDesc::new(move |_| {
            while !release.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            done.fetch_add(1, Ordering::SeqCst);
        })
    };
    let gate_handle = sisal::dispatch_small(vec![gate]).unwrap();

    let record = |label: &'static str| {
        let order = Arc::clone(&order);
        let done = Arc::clone(&done);
        move |_| {
            order.lock().unwrap().push(label);
            done.fetch_add(1, Ordering::SeqCst);
        }
    };
    let lows: Vec<_> = (0..2)
        .map(|_| JobDesc::with_priority(JobPriority::Low, record("low")))
        .collect();
    let low_handle = sisal::dispatch_small(lows).unwrap();
    let highs: Vec<_> = (0..2)
        .map(|_| JobDesc::with_priority(JobPriority::High, record("high")))
        .collect();
    let high_handle = sisal::dispatch_small(highs).unwrap();

    release.store(true, Ordering::Release);
    let deadline = Instant::now() + Duration::from_secs(30);
    while done.load(Ordering::SeqCst) < 5 {
        assert!(Instant::now() < deadline, "jobs stalled behind the gate");
        thread::yield_now();
    }

    sisal::wait_jobs(high_handle);
    sisal::wait_jobs(low_handle);
    sisal::wait_jobs(gate_handle);

    let order = order.lock().unwrap().clone();
    assert_eq!(
        order,
        vec!["high", "high", "low", "low"],
        "every High entry must precede every Low entry"
    );

    sisal::shutdown();
}

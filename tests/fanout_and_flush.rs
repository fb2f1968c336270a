//! End-to-end scenarios from the scheduler's acceptance suite: fan-out
//! with backpressure over the sign queue, and a worker blocked in
//! `pop_due` waking promptly on `flush`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dnsked::fifoq::{FifoQueue, SubtaskStatus};
use dnsked::schedule::Scheduler;
use dnsked::task::{Task, TaskResult};
use dnsked::worker::WorkerPool;

#[test]
fn fan_out_with_backpressure_drains_five_thousand_items() {
    let queue: Arc<FifoQueue<u32>> = Arc::new(FifoQueue::new(1000));
    const OWNER: usize = 0;
    const TOTAL: u32 = 5000;

    let mut consumers = Vec::new();
    for _ in 0..3 {
        let queue = Arc::clone(&queue);
        consumers.push(thread::spawn(move || loop {
            match queue.pop() {
                Some((_, owner)) => queue.report(owner, SubtaskStatus::Success),
                None => break,
            }
        }));
    }

    let producer_queue = Arc::clone(&queue);
    let producer = thread::spawn(move || {
        let mut pushed = 0u32;
        while pushed < TOTAL {
            let mut tries = 0;
            match producer_queue.push(pushed, OWNER, &mut tries) {
                Ok(()) => pushed += 1,
                Err(_) => {
                    // retry budget exhausted: the consumers are still
                    // draining, so just try again with a fresh budget
                }
            }
        }
    });
    producer.join().unwrap();

    let failed = queue.wait_for(OWNER, TOTAL as u64);
    assert_eq!(failed, 0);
    assert_eq!(queue.len(), 0);

    queue.notify_all();
    for c in consumers {
        c.join().unwrap();
    }
}

#[test]
fn worker_blocked_in_pop_due_wakes_promptly_on_flush() {
    let scheduler = Scheduler::create();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);

    let far_future = dnsked::duration::now() + 600;
    let task = Task::new(
        "z1",
        "enforcer",
        "resalt",
        Box::new(move |_, _, _, _| {
            ran2.fetch_add(1, Ordering::SeqCst);
            TaskResult::Success
        }),
        None,
        far_future,
    );
    scheduler.schedule(task, false).unwrap();

    let pool = WorkerPool::new(Arc::clone(&scheduler), 1);
    // Give the worker a moment to actually enter its blocking pop_due.
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    scheduler.flush();

    let deadline = start + Duration::from_secs(2);
    while ran.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let elapsed = start.elapsed();

    pool.stop(&scheduler);
    pool.join();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(elapsed < Duration::from_secs(2), "worker took {:?} to wake", elapsed);
}

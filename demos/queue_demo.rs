extern crate core_affinity;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rs_hazptr;

use rs_hazptr::lockfree_queue::LockFreeQueue;
use rs_hazptr::util;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;
use std::time::SystemTime;

struct GlobalControl {
    queue: LockFreeQueue<i64>,
    producers_left: AtomicI64,
    produced: AtomicI64,
    consumed: AtomicI64,
    total_value: AtomicI64,
}

fn set_cpu_affinity() {
    if let Some(cpus) = core_affinity::get_core_ids() {
        if !cpus.is_empty() {
            let slot = util::get_thread_id() as usize % cpus.len();
            core_affinity::set_for_current(cpus[slot]);
            info!("set_cpu_affinity {} {}", util::get_thread_id(), slot);
        }
    }
}

fn producer_thread(control: &GlobalControl, loop_cnt: i64) {
    set_cpu_affinity();
    let mut tol = 0;
    for i in 0..loop_cnt {
        control.queue.push(i);
        tol += 1;
        if i % 1024 == 0 {
            control.produced.fetch_add(tol, Ordering::Relaxed);
            tol = 0;
        }
    }
    control.produced.fetch_add(tol, Ordering::Relaxed);
    control.producers_left.fetch_sub(1, Ordering::Release);
}

fn consumer_thread(control: &GlobalControl) {
    set_cpu_affinity();
    let mut tol = 0;
    let mut tol_val = 0;
    loop {
        if let Some(v) = control.queue.pop() {
            tol_val += v;
            tol += 1;
            if tol % 1024 == 0 {
                control.consumed.fetch_add(tol, Ordering::Relaxed);
                control.total_value.fetch_add(tol_val, Ordering::Relaxed);
                tol = 0;
                tol_val = 0;
            }
        } else if control.producers_left.load(Ordering::Acquire) == 0 && control.queue.empty() {
            break;
        } else {
            util::pause();
        }
    }
    control.consumed.fetch_add(tol, Ordering::Relaxed);
    control.total_value.fetch_add(tol_val, Ordering::Relaxed);
}

fn debug_thread(control: &GlobalControl) {
    while control.producers_left.load(Ordering::Acquire) != 0 {
        info!(
            "debug_thread produced {} consumed {}",
            control.produced.load(Ordering::Relaxed),
            control.consumed.load(Ordering::Relaxed)
        );
        thread::sleep(time::Duration::from_millis(1000));
    }
}

fn run_queue_demo() {
    env_logger::init();

    let cpu_count = core_affinity::get_core_ids().map_or(4, |c| c.len()) as i64;

    let producer_count = (cpu_count + 1) / 2;
    let consumer_count = (cpu_count - producer_count).max(1);

    info!(
        "producer_count {} consumer_count {}",
        producer_count, consumer_count
    );

    let loop_cnt = 1_000_000_i64;
    info!("loop_cnt {}, total {}", loop_cnt, loop_cnt * producer_count);

    let control = Arc::new(GlobalControl {
        queue: LockFreeQueue::new(),
        producers_left: AtomicI64::new(producer_count),
        produced: AtomicI64::new(0),
        consumed: AtomicI64::new(0),
        total_value: AtomicI64::new(0),
    });

    let watch_thread = {
        let control = control.clone();
        thread::spawn(move || debug_thread(&control))
    };

    let mut producer_threads = vec![];
    let mut consumer_threads = vec![];
    for _ in 0..producer_count {
        let control = control.clone();
        producer_threads.push(thread::spawn(move || producer_thread(&control, loop_cnt)));
    }
    for _ in 0..consumer_count {
        let control = control.clone();
        consumer_threads.push(thread::spawn(move || consumer_thread(&control)));
    }

    for t in producer_threads {
        t.join().unwrap();
    }
    info!("producer_threads joined");

    for t in consumer_threads {
        t.join().unwrap();
    }
    info!("consumer_threads joined");

    watch_thread.join().unwrap();

    assert_eq!(
        control.total_value.load(Ordering::Relaxed),
        producer_count * (loop_cnt - 1) * loop_cnt / 2
    );
    assert_eq!(
        control.produced.load(Ordering::Relaxed),
        control.consumed.load(Ordering::Relaxed)
    );

    let stats = control.queue.statistics();
    println!("statistic:");
    println!("successful push number: {}", stats.successful_push);
    println!("successful pop number: {}", stats.successful_pop);
    println!("empty pop number: {}", stats.empty_pop);
    println!("clearing function call number: {}", stats.clearing_calls);
    println!(
        "loop iterations in successful push: {} (avg {:.3})",
        stats.loop_iterations_push,
        stats.loop_iterations_push as f64 / stats.successful_push as f64
    );
    println!(
        "loop iterations in successful pop: {} (avg {:.3})",
        stats.loop_iterations_pop,
        stats.loop_iterations_pop as f64 / stats.successful_pop as f64
    );
    println!("constructed nodes number: {}", stats.constructed_nodes);
    println!("destructed nodes number: {}", stats.destructed_nodes);
    println!("thread records allocated: {}", control.queue.thread_record_count());
}

fn main() {
    let start = SystemTime::now();
    run_queue_demo();
    let end = SystemTime::now();
    let cost = {
        let t = end.duration_since(start).unwrap();
        t.subsec_millis() as u64 + t.as_secs() * 1000
    };
    println!("time cost {} ms", cost);
}

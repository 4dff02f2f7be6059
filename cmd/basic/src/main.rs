//! Basic corio example
//!
//! Spawns a handful of fibers that yield and sleep, plus a one-shot and a
//! recurring timer, on a scheduler that includes the main thread.
//!
//! # Environment Variables
//!
//! - `CORIO_THREADS=4` - Worker count (the main thread counts as one)
//! - `CORIO_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `CORIO_LOG_LEVEL=debug` - Set log level (off, fatal, error, warn, info, debug, trace)

use corio::{current_id, kdebug, kinfo, sleep_ms, spawn, yield_now, Runtime, SchedulerConfig};
use corio::IoManager;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

// CORIO_LOG_LEVEL=debug CORIO_FLUSH_EPRINT=1 cargo run -p corio-basic
fn main() {
    println!("=== corio Basic Example ===\n");

    let config = SchedulerConfig::from_env().name("basic");
    config.print();

    let runtime = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let completed = Arc::new(AtomicUsize::new(0));
    let ticks = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let c = completed.clone();
    let t = ticks.clone();
    let result = runtime.block_on(move || {
        kinfo!("Spawning fibers...");

        for i in 1..=4u64 {
            let c = c.clone();
            let spawned = spawn(move || {
                kdebug!("[fiber {}] started as {}", i, current_id());
                for j in 0..3 {
                    kdebug!("[fiber {}] iteration {}", i, j);
                    yield_now();
                }
                sleep_ms(20 * i);
                kdebug!("[fiber {}] finished", i);
                c.fetch_add(1, Ordering::SeqCst);
            });
            if let Err(e) = spawned {
                eprintln!("spawn failed: {}", e);
            }
        }

        let Some(reactor) = IoManager::current() else {
            eprintln!("not running under an io manager");
            return;
        };

        reactor.add_timer(50, || kinfo!("one-shot timer fired"), false);
        let ticker = reactor.add_timer(
            10,
            move || {
                let n = t.fetch_add(1, Ordering::SeqCst) + 1;
                kdebug!("tick {}", n);
            },
            true,
        );

        // a recurring timer keeps the scheduler alive until cancelled
        sleep_ms(100);
        ticker.cancel();
    });

    if let Err(e) = result {
        eprintln!("runtime error: {}", e);
    }

    kinfo!(
        "{} fiber(s) completed, {} tick(s), {:?}",
        completed.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst),
        start.elapsed()
    );
    println!("\n=== Example Complete ===");
}


//! Synthetic per-request CPU cost, controlled by the node's --load-factor
//! flag. Used in load-balancing demos to make some nodes measurably slower.

use log::debug;

/// Naive recursive Fibonacci. Deliberately exponential; fib(30) takes a few
/// milliseconds, fib(35) tens of milliseconds.
pub fn fib(n: u32) -> u64 {
    if n < 2 {
        n as u64
    } else {
        fib(n - 1) + fib(n - 2)
    }
}

/// Burns CPU proportional to the load factor on a blocking thread, so the
/// async workers keep serving other requests meanwhile. A load factor of 0
/// is free.
pub async fn simulate(load_factor: u32) {
    if load_factor == 0 {
        return;
    }
    let started = std::time::Instant::now();
    // The spawned computation is synchronous and cannot be cancelled; if the
    // join fails the request proceeds without the synthetic cost.
    let _ = tokio::task::spawn_blocking(move || fib(load_factor)).await;
    debug!("synthetic load fib({load_factor}) took {:.2?}", started.elapsed());
}

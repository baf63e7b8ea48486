//! Fiber-local storage walkthrough
//!
//! Fills the converted main fiber's FLS table until it reports `Full`,
//! frees a scattered handful of slots, and shows the order in which they
//! come back. Then shows that a second fiber starts with its own table.
//!
//! ```text
//! UFIBER_LOG_LEVEL=debug cargo run -p ufiber-fls
//! ```

use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};

use ufiber::{
    convert_thread_to_fiber, fls_alloc, fls_free, fls_get_value, fls_set_value, spawn_fiber,
    status_code, switch_to_fiber, FiberError, FiberId, FiberResult, FLS_CAPACITY,
};

/// Slots released after the table is full, in this order
const FREED: [usize; 7] = [5, 9, 11, 10, 12, 40, 8];

static MAIN_FIBER: AtomicU32 = AtomicU32::new(0);

fn fill() -> FiberResult<usize> {
    let mut successes = 0;
    loop {
        match fls_alloc() {
            Ok(index) => {
                fls_set_value(index, index as i64 * 2)?;
                successes += 1;
            }
            Err(FiberError::Full) => return Ok(successes),
            Err(e) => return Err(e),
        }
    }
}

fn run() -> FiberResult<()> {
    let main = convert_thread_to_fiber()?;
    MAIN_FIBER.store(main.as_u32(), Ordering::Release);

    let got = fill()?;
    println!("Tried allocating {} slots, got {} successes", FLS_CAPACITY + 1, got);
    println!("Value at slot 100: {}", fls_get_value(100)?);

    for index in FREED {
        fls_free(index)?;
    }
    println!("Freed {:?}", FREED);
    println!("Get on freed slot 9: {}", status_code(fls_get_value(9)));
    println!("Free of unallocated slot 9: {}", status_code(fls_free(9)));
    println!("Set on slot {}: {}", FLS_CAPACITY, status_code(fls_set_value(FLS_CAPACITY, 1)));

    let mut again = Vec::with_capacity(FREED.len());
    for _ in 0..FREED.len() {
        again.push(fls_alloc()?);
    }
    println!("Reallocated {:?}", again);
    println!("Next allocation: {}", status_code(fls_alloc()));

    let other = spawn_fiber(|| loop {
        let first = fls_alloc();
        println!("[FIBER] first allocation in a fresh fiber: {:?}", first);
        let main = FiberId::new(MAIN_FIBER.load(Ordering::Acquire));
        if unsafe { switch_to_fiber(main) }.is_err() {
            std::process::exit(1);
        }
    })?;
    unsafe { switch_to_fiber(other)? };

    println!("Back in main; slot 100 still holds {}", fls_get_value(100)?);
    ufiber::cleanup();
    Ok(())
}

fn main() -> ExitCode {
    println!("=== ufiber FLS Example ===\n");

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {} ({})", e, -ufiber::errno(e));
            ExitCode::FAILURE
        }
    }
}

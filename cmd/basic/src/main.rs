//! Basic fiber example
//!
//! The main thread becomes fiber 0 and round-robins two created fibers,
//! each of which prints and hands control straight back.
//!
//! # Environment Variables
//!
//! - `UFIBER_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace);
//!   debug and above also print the engine configuration
//! - `UFIBER_LOG_SWITCHES=1` - Trace every switch (needs trace level)
//! - `UFIBER_STACK_SIZE=64k` - Stack size of created fibers

use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};

use ufiber::{convert_thread_to_fiber, create_fiber, fiber_info, switch_to_fiber};
use ufiber::{kdebug, kinfo, FiberId, FiberResult, LogLevel};

const ROUNDS: usize = 3;

/// Fiber the workers return to
static MAIN_FIBER: AtomicU32 = AtomicU32::new(0);

extern "C" fn worker(n: usize) {
    loop {
        println!("[FIBER-{}] I'm alive.", n);
        let main = FiberId::new(MAIN_FIBER.load(Ordering::Acquire));
        if let Err(e) = unsafe { switch_to_fiber(main) } {
            eprintln!("[FIBER-{}] switch back failed: {}", n, e);
            std::process::exit(1);
        }
    }
}

fn run() -> FiberResult<()> {
    if ufiber::log_level() >= LogLevel::Debug {
        ufiber::engine().config().print();
    }

    let fid0 = convert_thread_to_fiber()?;
    MAIN_FIBER.store(fid0.as_u32(), Ordering::Release);
    kinfo!("main thread is fiber {}", fid0);

    println!("Creating fiber with entry {:p}", worker as extern "C" fn(usize));
    let fid1 = create_fiber(worker, 1)?;
    println!("Created Fiber {}", fid1);
    let fid2 = create_fiber(worker, 2)?;
    println!("Created Fiber {}", fid2);

    for round in 0..ROUNDS {
        println!("****");
        println!("[MAIN-{}] I'm alive (round {}).", fid0, round);
        unsafe { switch_to_fiber(fid1)? };
        unsafe { switch_to_fiber(fid2)? };
        kdebug!("round {} complete", round);
    }

    println!();
    for id in [fid0, fid1, fid2] {
        println!("--- fiber {} ---", id);
        print!("{}", fiber_info(id)?);
    }

    let removed = ufiber::cleanup();
    println!("Cleaned up {} fibers", removed);
    Ok(())
}

fn main() -> ExitCode {
    println!("=== ufiber Basic Example ===\n");

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {} ({})", e, -ufiber::errno(e));
            ExitCode::FAILURE
        }
    }
}

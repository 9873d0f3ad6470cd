//! Shared helpers for the integration tests in this directory.
#![allow(dead_code)]

use std::sync::Once;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Leaks a value to obtain a `'static` reference, so an `Rc`-based object
/// created on a loop thread can outlive the closure that creates it without
/// needing a thread-unsafe way to hand it back to the test thread.
pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

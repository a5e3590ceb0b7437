// Test-only printing helper: prints to stderr in test and debug builds, no-op otherwise.
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        if false { let _ = format!($($arg)*); }
    });
}

pub mod error;
pub mod config;
pub mod paths;
pub mod storage;
pub mod driver;
pub mod index;
pub mod groups;
pub mod iam;
pub mod gate;
pub mod sync;
pub mod tasks;
pub mod ops;
pub mod records;
pub mod identity;
pub mod explorer;
pub mod server;

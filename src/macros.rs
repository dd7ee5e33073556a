/// Increment a stats counter by 1.
///
/// Compiles to nothing when the `stats` feature is disabled.
macro_rules! stat_inc {
    ($counter:ident) => {
        #[cfg(feature = "stats")]
        {
            $crate::stats::STATS
                .$counter
                .fetch_add(1, ::core::sync::atomic::Ordering::Relaxed);
        }
    };
}

/// Add a value to a stats counter.
///
/// Compiles to nothing (including the value expression) when the `stats`
/// feature is disabled.
macro_rules! stat_add {
    ($counter:ident, $val:expr) => {
        #[cfg(feature = "stats")]
        {
            $crate::stats::STATS
                .$counter
                .fetch_add($val as u64, ::core::sync::atomic::Ordering::Relaxed);
        }
    };
}

/// Print a diagnostic line.
///
/// Compiles to nothing when the `debug` feature is disabled, so the
/// arguments must not carry side effects.
macro_rules! debug_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "debug")]
        {
            ::std::println!($($arg)*);
        }
    };
}

/// Abort the current operation on corrupted allocator bookkeeping.
///
/// Kept apart from the `Option` results used for page-heap exhaustion:
/// a `fatal!` is never a condition the caller can recover from.
macro_rules! fatal {
    ($($arg:tt)*) => {
        panic!("sweepalloc: fatal: {}", format_args!($($arg)*))
    };
}

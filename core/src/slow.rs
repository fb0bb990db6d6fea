//! Macros that do run-time safety checks. These can be disabled, but this increases
//! the risk of unsafe behavior.

/// `assert!` that is exists only if `"no-slow-safety-checks"` feature is not enabled.
#[cfg(not(feature = "no-slow-safety-checks"))]
#[macro_export]
macro_rules! subheap_slow_assert {
    ($($tt:tt)*) => {
        assert!($($tt)*)
    };
}

/// `assert!` that is exists only if `"no-slow-safety-checks"` feature is not enabled.
#[cfg(feature = "no-slow-safety-checks")]
#[macro_export]
macro_rules! subheap_slow_assert {
    ($($tt:tt)*) => {};
}

//! Crate-internal logging macros.
//!
//! - `tracing` feature: events go to `tracing` (wins when both features are on)
//! - `logging` feature: records go to `log`
//! - neither: the macros expand to `()`
//!
//! The backend is picked when the macro is defined, so every expansion is a
//! single expression and works in match arms as well as statements.

macro_rules! define_log_macro {
    ($name:ident, $level:ident, $dollar:tt) => {
        #[cfg(feature = "tracing")]
        #[allow(unused_macros)]
        macro_rules! $name {
            ($dollar($dollar arg:tt)*) => {
                tracing::$level!($dollar($dollar arg)*)
            };
        }

        #[cfg(all(not(feature = "tracing"), feature = "logging"))]
        #[allow(unused_macros)]
        macro_rules! $name {
            ($dollar($dollar arg:tt)*) => {
                log::$level!($dollar($dollar arg)*)
            };
        }

        #[cfg(not(any(feature = "tracing", feature = "logging")))]
        #[allow(unused_macros)]
        macro_rules! $name {
            ($dollar($dollar arg:tt)*) => {
                ()
            };
        }

        #[allow(unused_imports)]
        pub(crate) use $name;
    };
}

define_log_macro!(log_debug, debug, $);
define_log_macro!(log_info, info, $);
define_log_macro!(log_warn, warn, $);
define_log_macro!(log_error, error, $);

//! Logging macros used throughout this crate
//!
//! With the `defmt` feature enabled, these forward to the macros of the same
//! name in `defmt`. Without it, they expand to an expression that borrows every
//! argument, so that values computed only for logging don't trigger unused
//! variable warnings.


macro_rules! trace {
    ($fmt:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            defmt::trace!($fmt $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($(&$x,)*);
        }
    };
}

macro_rules! debug {
    ($fmt:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            defmt::debug!($fmt $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($(&$x,)*);
        }
    };
}

macro_rules! info {
    ($fmt:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            defmt::info!($fmt $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($(&$x,)*);
        }
    };
}

macro_rules! warn {
    ($fmt:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            defmt::warn!($fmt $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($(&$x,)*);
        }
    };
}

//! Logging facade for the scheduler hot paths.
//!
//! The run loop logs every pop, steal, token recognition, and LD state
//! change; that must cost nothing when nobody is listening. This module
//! re-exports the `tracing` macros when the `tracing-integration` feature
//! is enabled and otherwise provides no-op replacements that compile away
//! entirely, so call sites are written once:
//!
//! ```rust,ignore
//! use crate::tracing_compat::{debug, trace};
//!
//! trace!(core = index, "pop cown");
//! debug!(from = ?prev, to = ?next, "ld state change");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op macro implementations when tracing is disabled.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn test_macros_compile_in_both_modes() {
        trace!("trace message");
        debug!(count = 42, "debug with field");
        info!("info message");
        warn!(flag = true, "warn with field");
        error!("error message");
    }
}

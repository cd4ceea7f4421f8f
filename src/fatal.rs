//! The unrecoverable tier of error handling.
//!
//! A failing unwind primitive means the stack cannot be trusted any more, so
//! nothing in the walk returns such errors to its caller. They panic instead.
//! The native entry points are `extern "C"`, so a panic there aborts the
//! process; the generic functions panic normally, which is what tests observe.

use core::fmt;
use jit_eh_unwinder::UnwindError;

#[cold]
#[track_caller]
pub(crate) fn fatal_error(args: fmt::Arguments<'_>) -> ! {
    log::error!("fatal: {args}");
    panic!("{args}")
}

/// Converts unwinder failures into fatal errors.
pub(crate) trait OrFatal<T> {
    fn or_fatal(self, what: &str) -> T;
}

impl<T> OrFatal<T> for Result<T, UnwindError> {
    #[track_caller]
    fn or_fatal(self, what: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => fatal_error(format_args!("{what}: {e}")),
        }
    }
}

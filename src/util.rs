use std::fmt::Display;

use log::warn;

/// Log a failure that the caller deliberately does not propagate.
pub(crate) trait LogError {
    fn pipe_log<S: AsRef<str>, Formatter: FnOnce() -> S>(self, f: Formatter) -> Self;
}

impl<T, E: Display> LogError for Result<T, E> {
    fn pipe_log<S: AsRef<str>, Formatter: FnOnce() -> S>(self, f: Formatter) -> Self {
        if let Err(ref e) = self {
            warn!("{}: {}", f().as_ref(), e);
        }
        self
    }
}

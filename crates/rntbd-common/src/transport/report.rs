//! Logging for broken internal invariants.
//!
//! These are bugs, not runtime conditions, so they are logged at `error`
//! with a fixed prefix that makes them easy to grep for.

use std::fmt;

#[doc(hidden)]
pub fn report_issue(subject: &dyn fmt::Display, message: fmt::Arguments<'_>) {
    tracing::error!(subject = %subject, "Report this issue: {}", message);
}

/// Logs an issue against `subject` unless `predicate` holds. Evaluates to
/// the predicate.
#[macro_export]
macro_rules! report_issue_unless {
    ($predicate:expr, $subject:expr, $($arg:tt)+) => {{
        let holds: bool = $predicate;
        if !holds {
            $crate::transport::report::report_issue(&$subject, format_args!($($arg)+));
        }
        holds
    }};
}

/// Logs an issue against `subject` unconditionally.
#[macro_export]
macro_rules! report_issue {
    ($subject:expr, $($arg:tt)+) => {
        $crate::transport::report::report_issue(&$subject, format_args!($($arg)+))
    };
}

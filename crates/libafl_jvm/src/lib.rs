/*!
 * `LibAFL_jvm` rewrites JVM class files so that every control-flow edge, and every call
 * that may throw, bumps an 8-bit counter in a shared coverage map.
 *
 * The entry point is the [`EdgeCoverageInstrumentor`], which glues a [`CoverageState`]
 * (edge id allocation plus the map itself), a [`CallSiteFilter`] and a
 * [`flow::ControlFlowProbes`] implementation together.
 */
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    //unused_results
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    //trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
    //unused_results
))]
#![cfg_attr(
    test,
    deny(
        bad_style,
        dead_code,
        improper_ctypes,
        non_shorthand_field_patterns,
        no_mangle_generic_items,
        overflowing_literals,
        path_statements,
        patterns_in_fns_without_body,
        unconditional_recursion,
        unused,
        unused_allocation,
        unused_comparisons,
        unused_parens,
        while_true
    )
)]

include!(concat!(env!("OUT_DIR"), "/constants.rs"));

pub mod classfile;
pub mod coverage;
pub mod filter;
pub mod flow;
pub mod instrumentor;
pub mod nothrow;
pub mod probe;

use core::{
    fmt::{self, Display},
    num::TryFromIntError,
    str::Utf8Error,
};
use std::io;

pub use coverage::{CoverageMap, CoverageState, EdgeId, saturating_increment};
pub use filter::{CallSiteFilter, PackagePrefixes, SelfExclusion};
pub use instrumentor::{
    ClassReport, EdgeCoverageInstrumentor, InstrumentationMode, Instrumentor, MethodReport,
};
pub use nothrow::{NoThrowEntry, NoThrowTable};
pub use probe::CoverageMapTarget;

#[cfg(feature = "errors_backtrace")]
/// Error Backtrace type when `errors_backtrace` feature is enabled (== [`Backtrace`](std::backtrace::Backtrace`))
pub type ErrorBacktrace = std::backtrace::Backtrace;

#[cfg(not(feature = "errors_backtrace"))]
#[derive(Debug, Default)]
/// ZST to use when `errors_backtrace` is disabled
pub struct ErrorBacktrace;

#[cfg(not(feature = "errors_backtrace"))]
impl ErrorBacktrace {
    /// Nop
    #[must_use]
    pub fn capture() -> Self {
        Self
    }
}

#[cfg(feature = "errors_backtrace")]
fn display_error_backtrace(f: &mut fmt::Formatter, err: &ErrorBacktrace) -> fmt::Result {
    write!(f, "\nBacktrace: {err:?}")
}
#[cfg(not(feature = "errors_backtrace"))]
#[expect(clippy::unnecessary_wraps)]
fn display_error_backtrace(_f: &mut fmt::Formatter, _err: &ErrorBacktrace) -> fmt::Result {
    fmt::Result::Ok(())
}

/// Main error struct for `LibAFL_jvm`
#[derive(Debug)]
pub enum Error {
    /// The class file could not be parsed, or its code is not well-formed.
    Structural(String, ErrorBacktrace),
    /// A per-class or per-method resource (local slots, code size, constant pool) ran out.
    Capacity(String, ErrorBacktrace),
    /// The coverage map could not grow any further.
    MapGrowth(String, ErrorBacktrace),
    /// Serialization error
    Serialize(String, ErrorBacktrace),
    /// You're holding it wrong
    IllegalState(String, ErrorBacktrace),
    /// The argument passed to this method or function is not valid
    IllegalArgument(String, ErrorBacktrace),
    /// OS error, wrapping a [`io::Error`]
    OsError(io::Error, String, ErrorBacktrace),
}

impl Error {
    /// The input is not a well-formed class file
    #[must_use]
    pub fn structural<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Structural(arg.into(), ErrorBacktrace::capture())
    }

    /// A method or class ran out of room for the instrumentation
    #[must_use]
    pub fn capacity<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Capacity(arg.into(), ErrorBacktrace::capture())
    }

    /// The coverage map cannot be enlarged
    #[must_use]
    pub fn map_growth<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::MapGrowth(arg.into(), ErrorBacktrace::capture())
    }

    /// Serialization error
    #[must_use]
    pub fn serialize<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::Serialize(arg.into(), ErrorBacktrace::capture())
    }

    /// You're holding it wrong
    #[must_use]
    pub fn illegal_state<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalState(arg.into(), ErrorBacktrace::capture())
    }

    /// The argument passed to this method or function is not valid
    #[must_use]
    pub fn illegal_argument<S>(arg: S) -> Self
    where
        S: Into<String>,
    {
        Error::IllegalArgument(arg.into(), ErrorBacktrace::capture())
    }

    /// OS error with additional message
    #[must_use]
    pub fn os_error<S>(err: io::Error, msg: S) -> Self
    where
        S: Into<String>,
    {
        Error::OsError(err, msg.into(), ErrorBacktrace::capture())
    }

    /// Prefixes the message with the method the error happened in.
    #[must_use]
    pub fn in_method(self, owner: &str, name: &str, descriptor: &str) -> Self {
        let ctx = |s: String| format!("{owner}.{name}{descriptor}: {s}");
        match self {
            Self::Structural(s, b) => Self::Structural(ctx(s), b),
            Self::Capacity(s, b) => Self::Capacity(ctx(s), b),
            other => other,
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        if let Self::OsError(err, _, _) = self {
            Some(err)
        } else {
            None
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Structural(s, b) => {
                write!(f, "Malformed class file: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Capacity(s, b) => {
                write!(f, "Capacity exceeded: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::MapGrowth(s, b) => {
                write!(f, "Coverage map growth failed: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::Serialize(s, b) => {
                write!(f, "Error in Serialization: `{0}`", &s)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalState(s, b) => {
                write!(f, "Illegal state: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::IllegalArgument(s, b) => {
                write!(f, "Illegal argument: {0}", &s)?;
                display_error_backtrace(f, b)
            }
            Self::OsError(err, s, b) => {
                write!(f, "OS error: {0}: {1}", &s, err)?;
                display_error_backtrace(f, b)
            }
        }
    }
}

/// Stringify the postcard serializer error
impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Self::serialize(format!("{err:?}"))
    }
}

/// Stringify the json serializer error
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialize(format!("{err:?}"))
    }
}

/// Create an AFL Error from io Error
impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::os_error(err, "io::Error ocurred")
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Self {
        Self::structural(format!("Could not convert byte / utf-8: {err:?}"))
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Self::capacity(format!("Expected conversion failed: {err:?}"))
    }
}

// This file is part of DSS Edge, an edge video management system.
// Copyright (C) 2025 The DSS Edge Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error type shared by all DSS Edge crates.
//!
//! Errors carry a [`ErrorKind`], an optional message, and an optional source,
//! and are built with the [`err!`]/[`bail!`] macros:
//!
//! ```
//! use dss_base::{bail, err, Error, ErrorKind};
//! let e = err!(NotFound, msg("no segment {}", 3));
//! assert_eq!(e.kind(), ErrorKind::NotFound);
//! let f = || -> Result<(), Error> { bail!(InvalidArgument, msg("bad speed")) };
//! assert_eq!(f().unwrap_err().kind(), ErrorKind::InvalidArgument);
//! ```

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        })
    }
}

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug)]
struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedError>,
}

/// An error with a [`ErrorKind`], an optional message, and an optional source.
#[derive(Debug)]
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn new(kind: ErrorKind, msg: Option<String>, source: Option<BoxedError>) -> Self {
        Error(Box::new(ErrorInner { kind, msg, source }))
    }

    /// Wraps a source error, keeping its message out of this error's own.
    pub fn wrap<E: Into<BoxedError>>(kind: ErrorKind, source: E) -> Self {
        Error::new(kind, None, Some(source.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns an object which displays this error and its causes, one
    /// `: `-separated hop at a time. Intended for log lines:
    /// `error!(err = %e.chain(), "...")`.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.msg.as_deref() {
            Some(msg) => write!(f, "{}: {}", self.0.kind, msg),
            None => fmt::Display::fmt(&self.0.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Displays an [`Error`] together with its full cause chain.
pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind.
    ///
    /// ```
    /// use dss_base::{ErrorKind, ResultExt as _};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxedError>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Constructs an [`Error`] from an `ErrorKind` and optional `msg(...)` and
/// `source(...)` arguments, in that order.
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, None)
    };
    ($kind:ident, msg($($msg:tt)*) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)*)), None)
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr) $(,)?) => {
        $crate::Error::new(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)*)),
            Some($source.into()),
        )
    };
    ($kind:ident, source($source:expr) $(,)?) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, Some($source.into()))
    };
}

/// Like [`err!`], but immediately returns the error from the enclosing
/// function.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::err!($($arg)*).into())
    };
}

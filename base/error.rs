// This file is part of lightnvr, a lightweight network video recorder.
// Copyright (C) 2026 The lightnvr Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Error type used throughout the workspace.
//!
//! An [`Error`] is a kind, an optional message, and an optional source chain.
//! Construct with the [`err!`](crate::err!) and [`bail!`](crate::bail!)
//! macros; display the full chain via [`Error::chain`].

use std::fmt::{self, Write as _};

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link for
/// descriptions of each error.
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

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Boxed so that `Result<T, Error>` stays a pointer wide on the happy path.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns an object that `Display`s the full cause chain,
    /// `msg: cause: cause`-style. The plain `Display` impl shows only the
    /// outermost layer.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }

    pub fn map_kind(mut self, kind: ErrorKind) -> Self {
        self.0.kind = kind;
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.msg {
            Some(msg) => write!(f, "{}: {}", self.0.kind, msg),
            None => match &self.0.source {
                Some(s) => write!(f, "{}: {}", self.0.kind, s),
                None => fmt::Display::fmt(&self.0.kind, f),
            },
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
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

/// `Display`s an [`Error`] with all its causes; see [`Error::chain`].
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut msg = self.0.to_string();
        // Without a message the outermost source is already part of the
        // `Display` form above; start the chain below it.
        let mut source = match self.0.msg() {
            Some(_) => std::error::Error::source(self.0),
            None => std::error::Error::source(self.0).and_then(|s| s.source()),
        };
        while let Some(s) = source {
            write!(&mut msg, ": {s}").expect("write to String can't fail");
            source = s.source();
        }
        f.write_str(&msg)
    }
}

/// Builder used by the [`err!`](crate::err!) macro; rarely called directly.
pub struct ErrorBuilder(Box<ErrorInner>);

impl ErrorBuilder {
    pub fn new(kind: ErrorKind) -> Self {
        Self(Box::new(ErrorInner {
            kind,
            msg: None,
            source: None,
        }))
    }

    pub fn msg(mut self, msg: String) -> Self {
        self.0.msg = Some(msg);
        self
    }

    pub fn source<S: Into<Box<dyn std::error::Error + Send + Sync>>>(mut self, source: S) -> Self {
        self.0.source = Some(source.into());
        self
    }

    pub fn build(self) -> Error {
        Error(self.0)
    }
}

fn io_error_kind(e: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as K;
    match e.kind() {
        K::NotFound => ErrorKind::NotFound,
        K::PermissionDenied => ErrorKind::PermissionDenied,
        K::AlreadyExists => ErrorKind::AlreadyExists,
        K::InvalidInput | K::InvalidData => ErrorKind::InvalidArgument,
        K::TimedOut => ErrorKind::DeadlineExceeded,
        K::Interrupted => ErrorKind::Aborted,
        _ => ErrorKind::Unknown,
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ErrorBuilder::new(io_error_kind(&e)).source(e).build()
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        let kind = match e {
            nix::Error::ENOENT => ErrorKind::NotFound,
            nix::Error::EACCES | nix::Error::EPERM => ErrorKind::PermissionDenied,
            nix::Error::EEXIST => ErrorKind::AlreadyExists,
            nix::Error::EINVAL => ErrorKind::InvalidArgument,
            nix::Error::ENOSPC => ErrorKind::ResourceExhausted,
            _ => ErrorKind::Unknown,
        };
        ErrorBuilder::new(kind).source(e).build()
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        let kind = match e {
            rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        };
        ErrorBuilder::new(kind).source(e).build()
    }
}

impl From<crate::shutdown::ShutdownError> for Error {
    fn from(e: crate::shutdown::ShutdownError) -> Self {
        ErrorBuilder::new(ErrorKind::Cancelled).source(e).build()
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, keeping it as the source.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| ErrorBuilder::new(k).source(e).build())
    }
}

/// Constructs an [`Error`] from an [`ErrorKind`] variant name and optional
/// `msg(...)` format args and `source(...)` cause.
///
/// ```
/// use lightnvr_base::{err, ErrorKind};
/// let e = err!(NotFound, msg("no stream {}", "back_door"));
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "Not found: no stream back_door");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind).build()
    };
    ($kind:ident, msg($($msg:tt)*)) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .msg(format!($($msg)*))
            .build()
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr)) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .msg(format!($($msg)*))
            .source($source)
            .build()
    };
    ($kind:ident, source($source:expr)) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .source($source)
            .build()
    };
}

/// Like [`err!`](crate::err!) but returns from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::err!($($arg)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_messages() {
        let e = err!(Unauthenticated, msg("unknown user: {}", "slamb"));
        assert_eq!(e.kind(), ErrorKind::Unauthenticated);
        assert_eq!(e.to_string(), "Unauthenticated: unknown user: slamb");
    }

    #[test]
    fn chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let e = err!(Internal, msg("cleanup failed"), source(io));
        let chained = e.chain().to_string();
        assert!(chained.contains("cleanup failed"), "{chained}");
        assert!(chained.contains("disk on fire"), "{chained}");
    }

    #[test]
    fn bail_returns() {
        fn f() -> Result<(), Error> {
            bail!(FailedPrecondition, msg("nope"));
        }
        assert_eq!(f().unwrap_err().kind(), ErrorKind::FailedPrecondition);
    }

    #[test]
    fn io_not_found_maps() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn err_kind_annotates() {
        let r: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(r.err_kind(ErrorKind::DataLoss).unwrap_err().kind(), ErrorKind::DataLoss);
    }
}

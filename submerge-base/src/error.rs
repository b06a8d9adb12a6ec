// We want a few things here:
// 1. A typed error kind so callers can match on what went wrong (Conflict,
//    LockLost, Timeout, ...) rather than stringly-typed failures.
// 2. A way to centralize setting a breakpoint to trap any error in the system
//    fairly soon after it's created (or at least when it's propagated from a
//    library we use back to us), same as before.
// 3. Same but for logging / emitting error messages into the tracing system.

use backtrace_error::DynBacktraceError;
use std::borrow::Cow;
use std::fmt;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// The kinds of failure the data plane can produce. `Fatal` is reserved for
/// states that should be impossible (a missing handler, a torn invariant);
/// everything else is meant to be recoverable by the caller.
#[derive(Debug)]
pub enum Error {
    SchemaMismatch { expected: String, found: String },
    UnknownField { name: String },
    Duplicate { id: String },
    NotFound { id: String },
    Conflict { id: String, detail: String },
    LockLost { chunk_id: String },
    Timeout,
    DirectoryTimeout { chunk_id: String },
    PeerUnreachable { peer: String },
    Decline,
    Invalid { reason: String },
    Wrapped(DynBacktraceError),
}

pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SchemaMismatch { expected, found } => {
                write!(f, "schema mismatch: expected {expected}, found {found}")
            }
            Error::UnknownField { name } => write!(f, "unknown field: {name}"),
            Error::Duplicate { id } => write!(f, "duplicate id: {id}"),
            Error::NotFound { id } => write!(f, "not found: {id}"),
            Error::Conflict { id, detail } => write!(f, "conflict on {id}: {detail}"),
            Error::LockLost { chunk_id } => write!(f, "lost lock on chunk {chunk_id}"),
            Error::Timeout => write!(f, "timeout"),
            Error::DirectoryTimeout { chunk_id } => {
                write!(f, "directory lookup timed out for chunk {chunk_id}")
            }
            Error::PeerUnreachable { peer } => write!(f, "peer unreachable: {peer}"),
            Error::Decline => write!(f, "declined"),
            Error::Invalid { reason } => write!(f, "invalid: {reason}"),
            Error::Wrapped(e) => write!(f, "{e}"),
        }
    }
}

impl Error {
    /// Construct a variant, logging it at the point of creation so a failure
    /// is visible even if a caller only checks the final `Result`.
    fn minted(self) -> Self {
        error!(target: "submerge", "{self}");
        self
    }

    pub fn schema_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Error {
        Error::SchemaMismatch { expected: expected.into(), found: found.into() }.minted()
    }
    pub fn unknown_field(name: impl Into<String>) -> Error {
        Error::UnknownField { name: name.into() }.minted()
    }
    pub fn duplicate(id: impl Into<String>) -> Error {
        Error::Duplicate { id: id.into() }.minted()
    }
    pub fn not_found(id: impl Into<String>) -> Error {
        Error::NotFound { id: id.into() }.minted()
    }
    pub fn conflict(id: impl Into<String>, detail: impl Into<String>) -> Error {
        Error::Conflict { id: id.into(), detail: detail.into() }.minted()
    }
    pub fn lock_lost(chunk_id: impl Into<String>) -> Error {
        Error::LockLost { chunk_id: chunk_id.into() }.minted()
    }
    pub fn timeout() -> Error {
        Error::Timeout.minted()
    }
    pub fn directory_timeout(chunk_id: impl Into<String>) -> Error {
        Error::DirectoryTimeout { chunk_id: chunk_id.into() }.minted()
    }
    pub fn peer_unreachable(peer: impl Into<String>) -> Error {
        Error::PeerUnreachable { peer: peer.into() }.minted()
    }
    pub fn decline() -> Error {
        Error::Decline.minted()
    }
    pub fn invalid(reason: impl Into<String>) -> Error {
        Error::Invalid { reason: reason.into() }.minted()
    }

    /// True for anything a caller can reasonably retry or work around.
    /// `Fatal` states don't produce an `Error` at all: see [`fatal`].
    pub fn is_recoverable(&self) -> bool {
        true
    }
}

/// Kills the process. Reserved for states that should be impossible by
/// construction (a missing registered handler, a torn local invariant);
/// never used for a remote peer's misbehavior, which always surfaces as a
/// recoverable `Error` instead.
pub fn fatal(reason: impl Into<Cow<'static, str>>) -> ! {
    let reason = reason.into();
    error!(target: "submerge", "fatal: {reason}");
    panic!("submerge fatal error: {reason}");
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        error!(target: "submerge", "{:?}", err);
        Error::Wrapped(DynBacktraceError::from(err))
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::from(err)
}

#[test]
fn test_error_kinds_display() {
    assert_eq!(Error::timeout().to_string(), "timeout");
    assert_eq!(Error::duplicate("abc").to_string(), "duplicate id: abc");
    assert!(Error::not_found("xyz").is_recoverable());
}

#[test]
fn test_err_helper() {
    let _err = err("test error");
}

//! Error types for TideKV using snafu.
//!
//! Two layers exist on purpose, matching the split between what replicas
//! agree on and what a single process observes:
//!
//! - [`ErrCode`] is the replicated error code carried inside an
//!   `EvalResult`. It is plain data: serializable, copyable, and rendered
//!   with the wire-stable strings.
//! - [`KvError`] is the rich process-local error returned by fallible
//!   APIs (coordinator, codec, persistence glue). Its `Display` for the
//!   client-visible variants matches the same wire strings.

use snafu::Snafu;

use crate::codec::CodecError;

/// Unified result type for TideKV operations.
pub type Result<T, E = KvError> = std::result::Result<T, E>;

/// Replicated evaluation error code.
///
/// Stored in replies that cross the apply stream, so it must stay plain
/// data. The wire strings are stable protocol surface; never change them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrCode {
    /// Exact read of a key with no live entry.
    KeyNotFound,
    /// Request must be retried against the current leader.
    WrongLeader,
    /// The coordinator gave up waiting for the apply loop.
    Timeout,
    /// A reply for a different request surfaced at the awaited index.
    Unexpected,
    /// A relaxed read batch contained a non-GET command.
    GetOnly,
    /// WATCH was issued but no change-capture handler is attached.
    NoWatch,
    /// Unknown opcode reached the evaluator.
    NotImpl,
}

impl ErrCode {
    /// The stable wire string for this code.
    pub fn wire(self) -> &'static str {
        match self {
            Self::KeyNotFound => "Errkeynotfound",
            Self::WrongLeader => "ErrWrongLeader",
            Self::Timeout => "ErrTimeout",
            Self::Unexpected => "ErrUnexpected",
            Self::GetOnly => "err get only in unserializable reads",
            Self::NoWatch => "err watches not enabled",
            Self::NotImpl => "err not impl",
        }
    }
}

impl std::fmt::Display for ErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire())
    }
}

/// Top-level error type for TideKV operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum KvError {
    /// Exact read of a key with no live entry.
    #[snafu(display("Errkeynotfound"))]
    KeyNotFound,

    /// This replica is not the leader; the client must retry elsewhere.
    #[snafu(display("ErrWrongLeader"))]
    WrongLeader,

    /// No reply arrived for the proposed index within the deadline.
    #[snafu(display("ErrTimeout"))]
    Timeout,

    /// A reply surfaced that does not belong to the caller's request.
    #[snafu(display("ErrUnexpected"))]
    Unexpected,

    /// A relaxed read batch contained a non-GET command.
    #[snafu(display("err get only in unserializable reads"))]
    GetOnly,

    /// WATCH was issued but no change-capture handler is attached.
    #[snafu(display("err watches not enabled"))]
    NoWatch,

    /// Unknown opcode reached the evaluator.
    #[snafu(display("err not impl"))]
    NotImpl,

    /// Command or snapshot (de)serialization failed.
    #[snafu(display("codec error: {source}"))]
    Codec {
        /// The underlying codec failure.
        source: CodecError,
    },
}

impl KvError {
    /// The replicated code for this error, if it has one.
    ///
    /// `Codec` has no wire representation: on the apply path a decode
    /// failure is fatal rather than reported.
    pub fn code(&self) -> Option<ErrCode> {
        match self {
            Self::KeyNotFound => Some(ErrCode::KeyNotFound),
            Self::WrongLeader => Some(ErrCode::WrongLeader),
            Self::Timeout => Some(ErrCode::Timeout),
            Self::Unexpected => Some(ErrCode::Unexpected),
            Self::GetOnly => Some(ErrCode::GetOnly),
            Self::NoWatch => Some(ErrCode::NoWatch),
            Self::NotImpl => Some(ErrCode::NotImpl),
            Self::Codec { .. } => None,
        }
    }
}

impl From<ErrCode> for KvError {
    fn from(code: ErrCode) -> Self {
        match code {
            ErrCode::KeyNotFound => Self::KeyNotFound,
            ErrCode::WrongLeader => Self::WrongLeader,
            ErrCode::Timeout => Self::Timeout,
            ErrCode::Unexpected => Self::Unexpected,
            ErrCode::GetOnly => Self::GetOnly,
            ErrCode::NoWatch => Self::NoWatch,
            ErrCode::NotImpl => Self::NotImpl,
        }
    }
}

//! Error types returned by the limiter

use std::fmt::{Display, Formatter};

use crate::limits::LimitName;

/// A specialized [`Result`](std::result::Result) type for limiter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A single limit that rejected an acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceededLimit {
    /// The limit that rejected the request.
    pub name: LimitName,

    /// How many millitokens were missing at decision time.
    pub deficit_milli: i64,

    /// Upper bound on the time until the deficit becomes refillable.
    pub retry_after_ms: i64,
}

/// Errors produced by the limiter.
///
/// The variants form a closed taxonomy: callers can match on the kind to
/// decide between retrying, surfacing the error, or backing off.
#[derive(Debug)]
pub enum Error {
    /// One or more limits rejected the acquire. Raised strictly before any
    /// store write for the rejected call.
    RateLimitExceeded {
        /// Every limit that had insufficient tokens.
        limits: Vec<ExceededLimit>,

        /// The maximum `retry_after_ms` across the offending limits.
        retry_after_ms: i64,
    },

    /// No limits were resolvable at any configuration level and none were
    /// supplied by the caller, or supplied limit parameters are invalid.
    Configuration(String),

    /// The entity does not exist. Distinct from "bucket does not yet exist":
    /// buckets are created lazily, entity metadata is not.
    EntityNotFound(String),

    /// The entity's declared parent does not exist.
    ParentNotFound(String),

    /// The backing store reported a failure. `transient` distinguishes
    /// throttling/timeouts (retried with backoff) from hard failures.
    StoreUnavailable {
        message: String,
        transient: bool,
    },

    /// The schema version persisted in the store does not match the version
    /// this client was built against.
    VersionMismatch {
        expected: u32,
        actual: u32,
    },

    /// An unexpected condition inside the limiter: contended writes that
    /// exhausted retries, malformed store items, rollback failures. Logged at
    /// the site of occurrence and never used to mask a caller's error.
    Internal(String),
}

impl Error {
    /// Creates a [`Error::RateLimitExceeded`] from the offending limits,
    /// deriving the maximum retry-after.
    pub(crate) fn exceeded(limits: Vec<ExceededLimit>) -> Self {
        let retry_after_ms = limits
            .iter()
            .map(|l| l.retry_after_ms)
            .max()
            .unwrap_or_default();
        Error::RateLimitExceeded { limits, retry_after_ms }
    }

    /// Whether the error indicates a condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable { transient: true, .. })
    }

    /// Whether this is a rate-limit rejection.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimitExceeded { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::RateLimitExceeded { limits, retry_after_ms } => {
                let names = limits
                    .iter()
                    .map(|l| l.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "rate limit exceeded for [{names}]; retry after {retry_after_ms} ms")
            }
            Error::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Error::EntityNotFound(id) => write!(f, "entity not found: {id}"),
            Error::ParentNotFound(id) => write!(f, "parent entity not found: {id}"),
            Error::StoreUnavailable { message, transient } => {
                let kind = if *transient { "transient" } else { "hard" };
                write!(f, "store unavailable ({kind}): {message}")
            }
            Error::VersionMismatch { expected, actual } => {
                write!(f, "schema version mismatch: client expects {expected}, store has {actual}")
            }
            Error::Internal(msg) => write!(f, "internal limiter error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

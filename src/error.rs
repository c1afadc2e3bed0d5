//! quorumkv errors. Every component surfaces errors to its callers as HTTP
//! status codes with a JSON body, so errors carry owned strings rather than
//! source errors, and each variant maps to exactly one status code.

use serde_derive::{Deserialize, Serialize};

/// A quorumkv error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Fewer live or responsive followers than the configured quorum. The
    /// operation was not performed; the caller decides whether to retry.
    QuorumUnavailable(String),
    /// The key does not exist on any queried replica.
    NotFound(String),
    /// The client exceeded its rate-limit window. `retry_after` is the number
    /// of seconds until the window resets.
    RateLimited { retry_after: u64 },
    /// The request was malformed, or not valid for this node's role.
    InvalidInput(String),
    /// Invalid or unexpected data received from a peer.
    InvalidData(String),
    /// A peer refused the connection or did not answer within its deadline.
    /// For quorum purposes this counts as a failed ack or read.
    Unavailable(String),
    /// An I/O or other internal error.
    IO(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::QuorumUnavailable(s) => write!(f, "quorum unavailable: {s}"),
            Error::NotFound(s) => write!(f, "not found: {s}"),
            Error::RateLimited { retry_after } => {
                write!(f, "rate limited, retry after {retry_after}s")
            }
            Error::InvalidInput(s) => write!(f, "invalid input: {s}"),
            Error::InvalidData(s) => write!(f, "invalid data: {s}"),
            Error::Unavailable(s) => write!(f, "unavailable: {s}"),
            Error::IO(s) => write!(f, "io error: {s}"),
        }
    }
}

impl Error {
    /// A stable machine-readable code, carried in JSON error bodies so that
    /// clients can reconstruct the variant across the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Error::QuorumUnavailable(_) => "quorum_unavailable",
            Error::NotFound(_) => "not_found",
            Error::RateLimited { .. } => "rate_limited",
            Error::InvalidInput(_) => "invalid_input",
            Error::InvalidData(_) => "invalid_data",
            Error::Unavailable(_) => "unavailable",
            Error::IO(_) => "io",
        }
    }

    /// The HTTP status code this error surfaces as.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::QuorumUnavailable(_) => 503,
            Error::NotFound(_) => 404,
            Error::RateLimited { .. } => 429,
            Error::InvalidInput(_) => 400,
            Error::InvalidData(_) => 400,
            Error::Unavailable(_) => 503,
            Error::IO(_) => 500,
        }
    }

    /// Reconstructs an error from a wire code and message, falling back to
    /// the HTTP status when the code is unknown.
    pub fn from_wire(status: u16, code: &str, message: String, retry_after: Option<u64>) -> Self {
        match code {
            "quorum_unavailable" => Error::QuorumUnavailable(message),
            "not_found" => Error::NotFound(message),
            "rate_limited" => Error::RateLimited { retry_after: retry_after.unwrap_or(0) },
            "invalid_input" => Error::InvalidInput(message),
            "invalid_data" => Error::InvalidData(message),
            "unavailable" => Error::Unavailable(message),
            "io" => Error::IO(message),
            _ => match status {
                404 => Error::NotFound(message),
                429 => Error::RateLimited { retry_after: retry_after.unwrap_or(0) },
                400 => Error::InvalidInput(message),
                503 => Error::Unavailable(message),
                _ => Error::IO(message),
            },
        }
    }

    /// Whether the error may succeed on retry (peer or quorum hiccups).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::QuorumUnavailable(_) | Error::Unavailable(_))
    }
}

/// Constructs an Error::InvalidInput via format!() and converts it into any
/// Result<T>, for use in return statements.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidData via format!() and converts it into any
/// Result<T>, for use in return statements.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// A quorumkv Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Connection and deadline failures count as failed acks/reads for
        // quorum purposes; everything else is unexpected.
        if err.is_timeout() || err.is_connect() {
            Error::Unavailable(err.to_string())
        } else if err.is_decode() {
            Error::InvalidData(err.to_string())
        } else {
            Error::IO(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_wire() {
        let errors = [
            Error::QuorumUnavailable("1 live < W=2".into()),
            Error::NotFound("key 'a'".into()),
            Error::RateLimited { retry_after: 7 },
            Error::InvalidInput("empty key".into()),
            Error::InvalidData("bogus version".into()),
            Error::Unavailable("connection refused".into()),
            Error::IO("broken pipe".into()),
        ];
        for error in errors {
            let retry_after = match error {
                Error::RateLimited { retry_after } => Some(retry_after),
                _ => None,
            };
            let message = match &error {
                Error::RateLimited { .. } => String::new(),
                Error::QuorumUnavailable(s)
                | Error::NotFound(s)
                | Error::InvalidInput(s)
                | Error::InvalidData(s)
                | Error::Unavailable(s)
                | Error::IO(s) => s.clone(),
            };
            let decoded = Error::from_wire(error.http_status(), error.code(), message, retry_after);
            assert_eq!(decoded, error);
        }
    }

    #[test]
    fn unknown_code_falls_back_to_status() {
        let err = Error::from_wire(404, "bogus", "key 'x'".into(), None);
        assert_eq!(err, Error::NotFound("key 'x'".into()));
        let err = Error::from_wire(503, "bogus", "down".into(), None);
        assert_eq!(err, Error::Unavailable("down".into()));
    }
}

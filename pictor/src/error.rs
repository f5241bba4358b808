//! Error types for the request-processing engine.
//!
//! Every error carries an HTTP status so the engine can shape a response
//! without inspecting the error site. On the wire an error renders as
//! `{"message": "...", "status": N}` unless the error body is disabled.

use thiserror::Error;

/// Non-standard status reported when the client went away before the
/// response started (nginx convention).
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// Errors produced by the engine and its storage/processor collaborators.
///
/// Cloneable so a single computation result can be broadcast to every
/// coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No loader had the image, or the source resolved to nothing.
    #[error("pictor: not found")]
    NotFound,

    /// The image path failed validation (blacklist, prefix).
    #[error("pictor: invalid")]
    Invalid,

    /// URL signature wrong or missing while unsafe mode is off.
    #[error("pictor: url signature mismatch")]
    SignatureMismatch,

    /// Method other than GET or HEAD.
    #[error("pictor: method not allowed")]
    MethodNotAllowed,

    /// A load, process or admission deadline fired.
    #[error("pictor: timeout")]
    Timeout,

    /// The client disconnected before the response started.
    #[error("pictor: request cancelled")]
    Cancelled,

    /// The admission gate rejected the request outright.
    #[error("pictor: too many requests")]
    TooManyRequests,

    /// A processor cannot handle the input format.
    #[error("pictor: unsupported image format")]
    UnsupportedFormat,

    /// A stored object is older than the configured expiration window.
    #[error("pictor: expired")]
    Expired,

    /// Sentinel: a processor declines and the next one should be tried.
    /// Never user-visible.
    #[error("pictor: pass")]
    Pass,

    /// Anything else, carrying its own message and status.
    #[error("{message}")]
    Internal { message: String, status: u16 },
}

impl Error {
    /// Wraps an arbitrary error message as a 500.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            status: 500,
        }
    }

    /// Wraps a message with an explicit HTTP status.
    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self::Internal {
            message: message.into(),
            status,
        }
    }

    /// The HTTP status this error maps to.
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Invalid => 400,
            Self::SignatureMismatch => 403,
            Self::MethodNotAllowed => 405,
            Self::Timeout => 408,
            Self::Cancelled => STATUS_CLIENT_CLOSED_REQUEST,
            Self::TooManyRequests => 429,
            Self::UnsupportedFormat => 406,
            // expired stored objects behave like missing ones
            Self::Expired => 404,
            // sentinel, surfaced as a server fault if it ever leaks
            Self::Pass => 500,
            Self::Internal { status, .. } => *status,
        }
    }

    /// The JSON body written for this error.
    pub fn to_body(&self) -> String {
        serde_json::json!({
            "message": self.to_string(),
            "status": self.status(),
        })
        .to_string()
    }

    /// True when a loader reporting this error should be skipped in favor
    /// of the next one.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound | Self::Expired)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::internal(format!("io error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::NotFound.status(), 404);
        assert_eq!(Error::Invalid.status(), 400);
        assert_eq!(Error::SignatureMismatch.status(), 403);
        assert_eq!(Error::MethodNotAllowed.status(), 405);
        assert_eq!(Error::Timeout.status(), 408);
        assert_eq!(Error::Cancelled.status(), 499);
        assert_eq!(Error::TooManyRequests.status(), 429);
        assert_eq!(Error::UnsupportedFormat.status(), 406);
        assert_eq!(Error::Expired.status(), 404);
        assert_eq!(Error::internal("boom").status(), 500);
        assert_eq!(Error::with_status("gone", 410).status(), 410);
    }

    #[test]
    fn test_body_shape() {
        assert_eq!(
            Error::SignatureMismatch.to_body(),
            r#"{"message":"pictor: url signature mismatch","status":403}"#
        );
        assert_eq!(
            Error::internal("unexpected error").to_body(),
            r#"{"message":"unexpected error","status":500}"#
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let nf = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from(nf), Error::NotFound);

        let other = std::io::Error::other("disk on fire");
        assert_eq!(Error::from(other).status(), 500);
    }

    #[test]
    fn test_not_found_family() {
        assert!(Error::NotFound.is_not_found());
        assert!(Error::Expired.is_not_found());
        assert!(!Error::Invalid.is_not_found());
    }
}

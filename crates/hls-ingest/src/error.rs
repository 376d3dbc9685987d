use reqwest::StatusCode;

/// Coarse classification used to decide how a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connect refused, timeout, truncated body. Retried with backoff.
    TransientNetwork,
    /// Bad padding, broken framing, unparseable playlist.
    MalformedContent,
    /// A stop boundary was reached while retiring a fetcher.
    OutOfRange,
    /// Not HLS, or packed audio without its timestamp tag.
    UnsupportedFormat,
    /// Segment list exhausted on a complete playlist.
    EndOfStream,
    /// Everything else: surfaced to the caller as is.
    Fatal,
}

/// Stage a transient request failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// No response yet: refused, timed out or answered with a transient
    /// status.
    Open,
    /// The response was accepted and its body broke off.
    Body,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IngestError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("cannot connect to {url}: {reason}")]
    CannotConnect { url: String, reason: String },

    #[error("stream reset while reading {url}: {reason}")]
    StreamReset { url: String, reason: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("malformed content: {reason}")]
    MalformedContent { reason: String },

    #[error("unknown elementary stream format")]
    UnknownFormat,

    #[error("unsupported source: {reason}")]
    UnsupportedSource { reason: String },

    #[error("end of stream")]
    EndOfStream,

    #[error("stop boundary reached")]
    OutOfRange,

    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("no data available yet")]
    WouldBlock,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl IngestError {
    pub fn invalid_url(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn cannot_connect(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::CannotConnect {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn stream_reset(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::StreamReset {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedContent {
            reason: reason.into(),
        }
    }

    pub fn unsupported_source(reason: impl Into<String>) -> Self {
        Self::UnsupportedSource {
            reason: reason.into(),
        }
    }

    pub fn invalid_operation(reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Map a transport error. Failures before any body byte arrived are
    /// connection failures; failures after that reset the stream.
    pub fn from_transport(err: &reqwest::Error, url: &str, body_started: bool) -> Self {
        if err.is_timeout() && !body_started {
            return Self::Timeout {
                reason: format!("{url}: {err}"),
            };
        }
        if body_started || err.is_body() || err.is_decode() {
            Self::stream_reset(url, err)
        } else {
            Self::cannot_connect(url, err)
        }
    }

    /// How far a request got before failing, for failures another attempt
    /// can fix. `None` for everything a retry cannot help with.
    pub fn failure_point(&self) -> Option<FailurePoint> {
        match self {
            Self::CannotConnect { .. } | Self::Timeout { .. } => Some(FailurePoint::Open),
            Self::HttpStatus { status, .. }
                if status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT =>
            {
                Some(FailurePoint::Open)
            }
            Self::StreamReset { .. } => Some(FailurePoint::Body),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_point().is_some()
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            _ if self.is_retryable() => ErrorCategory::TransientNetwork,
            Self::Playlist { .. }
            | Self::Decryption { .. }
            | Self::MalformedContent { .. }
            | Self::UnknownFormat => ErrorCategory::MalformedContent,
            Self::OutOfRange => ErrorCategory::OutOfRange,
            Self::UnsupportedSource { .. } => ErrorCategory::UnsupportedFormat,
            Self::EndOfStream => ErrorCategory::EndOfStream,
            _ => ErrorCategory::Fatal,
        }
    }

    /// Whether the error ends a stream normally rather than failing it.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream | Self::OutOfRange)
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = IngestError::http_status(StatusCode::SERVICE_UNAVAILABLE, "http://a/b.ts");
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::TransientNetwork);

        let err = IngestError::http_status(StatusCode::NOT_FOUND, "http://a/b.ts");
        assert!(!err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn failure_points() {
        assert_eq!(
            IngestError::cannot_connect("u", "refused").failure_point(),
            Some(FailurePoint::Open)
        );
        assert_eq!(
            IngestError::http_status(StatusCode::TOO_MANY_REQUESTS, "u").failure_point(),
            Some(FailurePoint::Open)
        );
        assert_eq!(
            IngestError::stream_reset("u", "eof").failure_point(),
            Some(FailurePoint::Body)
        );
        assert_eq!(IngestError::decryption("bad padding").failure_point(), None);
    }

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            IngestError::decryption("bad padding").category(),
            ErrorCategory::MalformedContent
        );
        assert_eq!(IngestError::OutOfRange.category(), ErrorCategory::OutOfRange);
        assert_eq!(
            IngestError::unsupported_source("no ID3").category(),
            ErrorCategory::UnsupportedFormat
        );
        assert_eq!(IngestError::EndOfStream.category(), ErrorCategory::EndOfStream);
        assert!(IngestError::OutOfRange.is_end_of_stream());
        assert_eq!(
            IngestError::stream_reset("u", "eof").category(),
            ErrorCategory::TransientNetwork
        );
    }
}

//! Error types for the QuickBase client.

use thiserror::Error;

/// Well-known `errcode` values reported by the QuickBase API.
///
/// The full list lives in the vendor's API guide; only the codes callers
/// commonly branch on are named here.
pub mod codes {
    /// Success.
    pub const NO_ERROR: i32 = 0;
    /// Unknown error.
    pub const UNKNOWN: i32 = 1;
    /// Invalid input.
    pub const INVALID_INPUT: i32 = 2;
    /// Insufficient permissions.
    pub const INSUFFICIENT_PERMISSIONS: i32 = 3;
    /// Bad or expired ticket.
    pub const BAD_TICKET: i32 = 4;
    /// Unknown username/password.
    pub const INVALID_CREDENTIALS: i32 = 20;
    /// Invalid application token.
    pub const INVALID_APPTOKEN: i32 = 24;
    /// No such record.
    pub const NO_SUCH_RECORD: i32 = 30;
    /// No such field.
    pub const NO_SUCH_FIELD: i32 = 31;
    /// The application or table does not exist.
    pub const NO_SUCH_DATABASE: i32 = 32;
}

/// Errors that can occur when talking to QuickBase.
#[derive(Debug, Error)]
pub enum QuickbaseError {
    /// HTTP transport failure or non-success HTTP status.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local I/O failure (upload and import sources).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The response was not well-formed XML.
    #[error("XML parse error: {0}")]
    Parse(String),

    /// The response was well-formed but not shaped like a QuickBase envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server reported a non-zero `errcode`.
    #[error("QuickBase error {code}: {text}{}", detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    Api {
        code: i32,
        text: String,
        detail: Option<String>,
    },

    /// A record stream failed after some records were already delivered.
    #[error("record stream ended early after {records_emitted} records: {cause}")]
    PartialStream {
        /// Records handed to the consumer before the failure.
        records_emitted: usize,
        /// What cut the stream short.
        #[source]
        cause: Box<QuickbaseError>,
    },

    /// A deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// The stream was cancelled through its cancellation token.
    #[error("record stream cancelled")]
    Cancelled,

    /// A request parameter cannot be encoded.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A service URL could not be parsed or joined.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Client configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl QuickbaseError {
    /// The server `errcode`, if this error (or the cause of a partial
    /// stream) was reported by QuickBase.
    pub fn api_code(&self) -> Option<i32> {
        match self {
            QuickbaseError::Api { code, .. } => Some(*code),
            QuickbaseError::PartialStream { cause, .. } => cause.api_code(),
            _ => None,
        }
    }

    /// Whether QuickBase rejected the username or password.
    pub fn is_invalid_credentials(&self) -> bool {
        self.api_code() == Some(codes::INVALID_CREDENTIALS)
    }

    /// Whether the error is a transport-level failure rather than a server answer.
    pub fn is_transport(&self) -> bool {
        match self {
            QuickbaseError::Http(_) | QuickbaseError::Io(_) | QuickbaseError::Timeout(_) => true,
            QuickbaseError::PartialStream { cause, .. } => cause.is_transport(),
            _ => false,
        }
    }
}

impl From<quick_xml::Error> for QuickbaseError {
    fn from(err: quick_xml::Error) -> Self {
        match err {
            quick_xml::Error::Io(io) => QuickbaseError::Io(std::io::Error::new(io.kind(), io.to_string())),
            other => QuickbaseError::Parse(other.to_string()),
        }
    }
}

impl From<quick_xml::events::attributes::AttrError> for QuickbaseError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        QuickbaseError::Parse(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = QuickbaseError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display_with_detail() {
        let err = QuickbaseError::Api {
            code: 31,
            text: "No such field".to_string(),
            detail: Some("field 99".to_string()),
        };
        assert_eq!(err.to_string(), "QuickBase error 31: No such field (field 99)");
    }

    #[test]
    fn test_api_code_through_partial_stream() {
        let err = QuickbaseError::PartialStream {
            records_emitted: 3,
            cause: Box::new(QuickbaseError::Api {
                code: codes::BAD_TICKET,
                text: "Invalid ticket".to_string(),
                detail: None,
            }),
        };
        assert_eq!(err.api_code(), Some(codes::BAD_TICKET));
        assert!(!err.is_transport());
    }

    #[test]
    fn test_invalid_credentials() {
        let err = QuickbaseError::Api {
            code: codes::INVALID_CREDENTIALS,
            text: "Sorry!".to_string(),
            detail: None,
        };
        assert!(err.is_invalid_credentials());
        assert!(!QuickbaseError::Cancelled.is_invalid_credentials());
    }
}

//! Error types and plain-text error responses for the mirror

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Error codes for user-visible mirror failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorErrorCode {
    /// Missing or malformed Host header
    MissingHostHeader,
    /// No site configured for the requested host
    UnknownSite,
    /// License check failed
    Unauthorized,
    /// Crawler that is not on the allow-list
    CrawlerBlocked,
    /// Origin unreachable and nothing cached for the key
    OriginUnavailable,
}

impl MirrorErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            MirrorErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            MirrorErrorCode::UnknownSite => StatusCode::NOT_FOUND,
            MirrorErrorCode::Unauthorized => StatusCode::FORBIDDEN,
            MirrorErrorCode::CrawlerBlocked => StatusCode::NOT_FOUND,
            MirrorErrorCode::OriginUnavailable => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code as a string for the X-Mirror-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            MirrorErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            MirrorErrorCode::UnknownSite => "UNKNOWN_SITE",
            MirrorErrorCode::Unauthorized => "UNAUTHORIZED",
            MirrorErrorCode::CrawlerBlocked => "CRAWLER_BLOCKED",
            MirrorErrorCode::OriginUnavailable => "ORIGIN_UNAVAILABLE",
        }
    }
}

/// Create a plain-text error response with X-Mirror-Error header
pub fn text_error_response(
    code: MirrorErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = message.into();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Mirror-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Rejected site configuration record
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("site '{domain}': invalid domain name")]
    InvalidDomain { domain: String },

    #[error("site '{domain}': invalid origin url '{url}': {reason}")]
    InvalidOriginUrl {
        domain: String,
        url: String,
        reason: String,
    },

    #[error("site '{domain}': {finds} find strings but {replaces} replacements")]
    MismatchedReplacePairs {
        domain: String,
        finds: usize,
        replaces: usize,
    },

    #[error("site '{domain}': cannot build find matcher: {reason}")]
    Matcher { domain: String, reason: String },
}

/// Cache read/write failure. Never fatal to a request.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("cache entry persist error: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Failure reaching or reading from the origin
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// License verdict failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("server address is not licensed")]
    AddressNotLicensed,

    #[error("license expired on {0}, please renew")]
    Expired(String),

    #[error("license date '{0}' is malformed")]
    MalformedDate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            MirrorErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(MirrorErrorCode::UnknownSite.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(MirrorErrorCode::CrawlerBlocked.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            MirrorErrorCode::OriginUnavailable.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(MirrorErrorCode::Unauthorized.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_error_code_header_values() {
        let codes = [
            (MirrorErrorCode::MissingHostHeader, "MISSING_HOST_HEADER"),
            (MirrorErrorCode::UnknownSite, "UNKNOWN_SITE"),
            (MirrorErrorCode::Unauthorized, "UNAUTHORIZED"),
            (MirrorErrorCode::CrawlerBlocked, "CRAWLER_BLOCKED"),
            (MirrorErrorCode::OriginUnavailable, "ORIGIN_UNAVAILABLE"),
        ];
        for (code, header) in codes {
            assert_eq!(code.as_header_value(), header);
            let response = text_error_response(code, "x");
            assert_eq!(response.status(), code.status_code());
            assert_eq!(response.headers().get("X-Mirror-Error").unwrap(), header);
        }
    }

    #[test]
    fn test_text_error_response() {
        let response = text_error_response(MirrorErrorCode::OriginUnavailable, "origin down");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers().get("X-Mirror-Error").unwrap(),
            "ORIGIN_UNAVAILABLE"
        );
    }

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::MismatchedReplacePairs {
            domain: "a.com".to_string(),
            finds: 2,
            replaces: 1,
        };
        assert_eq!(err.to_string(), "site 'a.com': 2 find strings but 1 replacements");
    }
}

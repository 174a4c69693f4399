//! HTTP method and version enums shared by requests and responses.

use curl::easy::HttpVersion;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Patch,
    Trace,
}

impl Method {
    /// The method name as it appears on the request line.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
        }
    }
}

/// HTTP version to request from the transport, and the version observed on
/// a delivered response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    /// Let the transport negotiate the best version available.
    #[default]
    UseBest,
    Http10,
    Http11,
    /// HTTP/2, falling back to HTTP/1.1 if the server does not support it.
    Http2,
    /// HTTP/2 over TLS only; plaintext requests use HTTP/1.1.
    Http2Tls,
    /// HTTP/2 with prior knowledge, no HTTP/1.1 upgrade dance.
    Http2Only,
}

impl Version {
    pub(crate) fn to_curl(self) -> HttpVersion {
        match self {
            Version::UseBest => HttpVersion::Any,
            Version::Http10 => HttpVersion::V10,
            Version::Http11 => HttpVersion::V11,
            Version::Http2 => HttpVersion::V2,
            Version::Http2Tls => HttpVersion::V2TLS,
            Version::Http2Only => HttpVersion::V2PriorKnowledge,
        }
    }

    /// Parse the version token of a response status line, e.g. `HTTP/1.1`.
    pub(crate) fn from_status_line(token: &str) -> Option<Version> {
        match token {
            "HTTP/1.0" => Some(Version::Http10),
            "HTTP/1.1" => Some(Version::Http11),
            "HTTP/2" | "HTTP/2.0" => Some(Version::Http2),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names() {
        assert_eq!(Method::Get.as_str(), "GET");
        assert_eq!(Method::Patch.as_str(), "PATCH");
        assert_eq!(Method::default(), Method::Get);
    }

    #[test]
    fn version_from_status_line() {
        assert_eq!(Version::from_status_line("HTTP/1.1"), Some(Version::Http11));
        assert_eq!(Version::from_status_line("HTTP/2"), Some(Version::Http2));
        assert_eq!(Version::from_status_line("HTTP/2.0"), Some(Version::Http2));
        assert_eq!(Version::from_status_line("SPDY/3"), None);
    }
}

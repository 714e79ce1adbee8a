//! Header representation, lookups and name-based exclusion filters.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use crate::error::{ProxyError, Result};

pub const CONNECTION: &str = "Connection";
pub const PROXY_CONNECTION: &str = "Proxy-Connection";
pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
pub const PROXY_AUTHENTICATE: &str = "Proxy-Authenticate";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const VIA: &str = "Via";

pub const KEEP_ALIVE: &str = "Keep-Alive";
pub const CLOSE: &str = "Close";
pub const IDENTITY: &str = "identity";

/// A single `name: value` header line. Names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parses a raw header line. The value is trimmed and may be empty; a
    /// missing `:` or an empty name is a protocol error.
    pub fn parse(line: &str) -> Result<Self> {
        if line.is_empty() {
            return Err(ProxyError::protocol("can't parse an empty line as a header"));
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::protocol(format!("header line '{}' missing separator", line)))?;

        let name = name.trim();
        if name.is_empty() {
            return Err(ProxyError::protocol(format!("header line '{}' missing name", line)));
        }

        Ok(Self::new(name, value.trim()))
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// First header with the given name.
pub fn find<'a>(headers: &'a [Header], name: &str) -> Option<&'a Header> {
    headers.iter().find(|h| h.matches_name(name))
}

fn has_value(headers: &[Header], name: &str, value: &str) -> bool {
    headers
        .iter()
        .any(|h| h.matches_name(name) && h.value.eq_ignore_ascii_case(value))
}

/// Any `Transfer-Encoding` other than `identity` means the body is chunked.
pub fn is_chunked(headers: &[Header]) -> bool {
    headers
        .iter()
        .any(|h| h.matches_name(TRANSFER_ENCODING) && !h.value.eq_ignore_ascii_case(IDENTITY))
}

/// Parsed `Content-Length`, or `None` when absent. Unparsable values are
/// logged and treated as absent.
pub fn content_length(headers: &[Header]) -> Option<u64> {
    for h in headers.iter().filter(|h| h.matches_name(CONTENT_LENGTH)) {
        match h.value.parse::<u64>() {
            Ok(n) => return Some(n),
            Err(_) => tracing::warn!(value = %h.value, "Couldn't parse content length header"),
        }
    }

    None
}

pub fn is_connection_close(headers: &[Header]) -> bool {
    has_value(headers, CONNECTION, CLOSE)
}

pub fn is_connection_keep_alive(headers: &[Header]) -> bool {
    has_value(headers, CONNECTION, KEEP_ALIVE)
}

pub fn is_proxy_connection_close(headers: &[Header]) -> bool {
    has_value(headers, PROXY_CONNECTION, CLOSE)
}

/// Drops headers whose names appear in a refusal list.
#[derive(Debug, Clone)]
pub struct HeaderFilter {
    refused: HashSet<String>,
}

impl HeaderFilter {
    pub fn new<I, T>(names: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        Self {
            refused: names
                .into_iter()
                .map(|n| n.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn refuses(&self, name: &str) -> bool {
        self.refused.contains(&name.to_ascii_lowercase())
    }

    pub fn filter<'a, I>(&self, headers: I) -> Vec<Header>
    where
        I: IntoIterator<Item = &'a Header>,
    {
        headers
            .into_iter()
            .filter(|h| !self.refuses(&h.name))
            .cloned()
            .collect()
    }
}

/// Never forwarded in either direction.
pub static NEVER_TRANSMIT: LazyLock<HeaderFilter> =
    LazyLock::new(|| HeaderFilter::new(["trailer", "upgrade"]));

/// Stripped from requests sent straight to the origin server, since the proxy
/// owns the backend socket lifecycle.
pub static DIRECT_REQUEST: LazyLock<HeaderFilter> = LazyLock::new(|| {
    HeaderFilter::new([
        "proxy-connection",
        "proxy-authorization",
        "proxy-authenticate",
        "connection",
        "keep-alive",
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_trims_name_and_value() {
        let h = Header::parse("  Host :  example.com  ").unwrap();
        assert_eq!(h.name, "Host");
        assert_eq!(h.value, "example.com");
    }

    #[test]
    fn parse_allows_empty_value() {
        let h = Header::parse("X-Empty:").unwrap();
        assert_eq!(h.value, "");
    }

    #[test]
    fn parse_rejects_missing_separator_and_name() {
        assert!(Header::parse("NoSeparator").is_err());
        assert!(Header::parse(": value").is_err());
    }

    #[test]
    fn value_keeps_later_colons() {
        let h = Header::parse("Host: example.com:8080").unwrap();
        assert_eq!(h.value, "example.com:8080");
    }

    #[test]
    fn chunked_detection_ignores_identity() {
        assert!(is_chunked(&[Header::new("transfer-encoding", "chunked")]));
        assert!(!is_chunked(&[Header::new("Transfer-Encoding", "Identity")]));
        assert!(!is_chunked(&[]));
    }

    #[test]
    fn content_length_skips_garbage() {
        assert_eq!(content_length(&[Header::new("content-length", "42")]), Some(42));
        assert_eq!(content_length(&[Header::new("Content-Length", "abc")]), None);
        assert_eq!(content_length(&[]), None);
    }

    #[test]
    fn connection_tokens_are_case_insensitive() {
        let headers = vec![
            Header::new("connection", "close"),
            Header::new("PROXY-CONNECTION", "CLOSE"),
        ];
        assert!(is_connection_close(&headers));
        assert!(is_proxy_connection_close(&headers));
        assert!(!is_connection_keep_alive(&headers));
    }

    #[test]
    fn filters_drop_listed_names_only() {
        let headers = vec![
            Header::new("Upgrade", "websocket"),
            Header::new("Proxy-Authorization", "Basic abc"),
            Header::new("Host", "example.com"),
        ];

        let kept = NEVER_TRANSMIT.filter(&headers);
        assert_eq!(kept.len(), 2);

        let direct = DIRECT_REQUEST.filter(&kept);
        assert_eq!(direct, vec![Header::new("Host", "example.com")]);
    }
}

use std::fmt;

use crate::error::{ProxyError, Result};
use crate::http::header::{self, Header};

/// HTTP request methods.
///
/// The proxy services CONNECT, GET, POST and HEAD. Anything else is kept
/// verbatim so the connection can name it in its 400 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// CONNECT - Open a raw tunnel to `host:port`
    CONNECT,
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// Any other token
    Other(String),
}

impl Method {
    /// Maps a request-line token to a method. Matching is case-sensitive, as
    /// method tokens are.
    ///
    /// # Example
    ///
    /// ```
    /// # use poxy::http::request::Method;
    /// assert_eq!(Method::parse("GET"), Method::GET);
    /// assert_eq!(Method::parse("get"), Method::Other("get".into()));
    /// ```
    pub fn parse(s: &str) -> Self {
        match s {
            "CONNECT" => Method::CONNECT,
            "GET" => Method::GET,
            "POST" => Method::POST,
            "HEAD" => Method::HEAD,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::CONNECT => "CONNECT",
            Method::GET => "GET",
            Method::POST => "POST",
            Method::HEAD => "HEAD",
            Method::Other(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two protocol versions the proxy speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            "" => Err(ProxyError::protocol("empty request version")),
            other => Err(ProxyError::protocol(format!("unknown version '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// Keep-alive default when the client sent no `Connection` header.
    pub fn keeps_alive_by_default(&self) -> bool {
        matches!(self, Version::Http11)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed request line plus headers.
///
/// The body is not part of the request: it is still sitting in the client
/// stream and is consumed by whichever handler services the request.
#[derive(Debug, Clone)]
pub struct Request {
    /// The HTTP method (GET, CONNECT, etc.)
    pub method: Method,
    /// Request target: an absolute URI, or `host:port` for CONNECT
    pub target: String,
    /// HTTP version from the request line
    pub version: Version,
    /// Headers in the order received
    pub headers: Vec<Header>,
}

impl Request {
    /// Retrieves the first header value with a case-insensitive name match.
    pub fn header(&self, name: &str) -> Option<&str> {
        header::find(&self.headers, name).map(|h| h.value.as_str())
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.target, self.version)
    }
}

/// Builder for constructing Request objects.
#[derive(Default)]
pub struct RequestBuilder {
    method: Option<Method>,
    target: Option<String>,
    version: Option<Version>,
    headers: Vec<Header>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn build(self) -> std::result::Result<Request, &'static str> {
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            target: self.target.ok_or("target missing")?,
            version: self.version.unwrap_or(Version::Http11),
            headers: self.headers,
        })
    }
}

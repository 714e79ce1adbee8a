use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::http::header::{self, Header};
use crate::http::parser::encode_line;
use crate::http::request::Version;
use crate::http::writer::CountingWriter;

/// Status codes the proxy produces itself. Backend statuses are relayed as
/// raw numbers and never pass through this type.
///
/// - `Ok` (200): CONNECT tunnel established
/// - `BadRequest` (400): Malformed or unsupported request
/// - `ProxyAuthenticationRequired` (407): Credentials missing or rejected
/// - `BadGateway` (502): Backend or forward proxy misbehaved
/// - `GatewayTimeout` (504): Backend connect timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 200 OK
    Ok,
    /// 400 Bad Request
    BadRequest,
    /// 407 Proxy Authentication Required
    ProxyAuthenticationRequired,
    /// 502 Bad Gateway
    BadGateway,
    /// 504 Gateway Timeout
    GatewayTimeout,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use poxy::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::ProxyAuthenticationRequired.as_u16(), 407);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::ProxyAuthenticationRequired => 407,
            StatusCode::BadGateway => 502,
            StatusCode::GatewayTimeout => 504,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::ProxyAuthenticationRequired => "Proxy Authentication Required",
            StatusCode::BadGateway => "Bad Gateway",
            StatusCode::GatewayTimeout => "Gateway Timeout",
        }
    }
}

/// An HTTP response being written to the client.
///
/// Status, headers and body must be written in that order. Everything goes
/// through a counting sink whose count restarts at [`Response::end_headers`],
/// so after the body is written the connection can compare the declared
/// `Content-Length` against what was actually sent.
pub struct Response<'a, W> {
    out: CountingWriter<&'a mut W>,
    version: Version,
    headers: Vec<Header>,
    content_length: Option<u64>,
    committed: bool,
}

impl<'a, W: AsyncWrite + Unpin> Response<'a, W> {
    /// Starts a response on `out`. The version is usually HTTP/1.0 until the
    /// request line has been parsed, so protocol errors can still be answered.
    pub fn new(out: &'a mut W, version: Version) -> Self {
        Self {
            out: CountingWriter::new(out),
            version,
            headers: Vec::new(),
            content_length: None,
            committed: false,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// Headers written so far.
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// True once any byte of the status line has been handed to the sink.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// The `Content-Length` this response declared, if any.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Bytes written after [`Response::end_headers`].
    pub fn body_len(&self) -> u64 {
        self.out.count()
    }

    /// Sink for the body. Only meaningful after [`Response::end_headers`].
    pub fn body(&mut self) -> &mut CountingWriter<&'a mut W> {
        &mut self.out
    }

    pub async fn write_status(&mut self, status: StatusCode) -> Result<()> {
        let version = self.version.as_str();
        self.write_status_line(version, status.as_u16(), Some(status.reason_phrase()))
            .await
    }

    /// Writes a status line with an explicit version, as relayed from a
    /// backend.
    pub async fn write_status_line(
        &mut self,
        version: &str,
        code: u16,
        reason: Option<&str>,
    ) -> Result<()> {
        let line = match reason {
            Some(reason) => format!("{} {} {}", version, code, reason),
            None => format!("{} {}", version, code),
        };

        tracing::debug!(status = %line, "Response");
        self.committed = true;
        self.write_line(&line).await
    }

    pub async fn write_header(&mut self, header: Header) -> Result<()> {
        if header.matches_name(header::CONTENT_LENGTH) {
            match header.value.parse::<u64>() {
                Ok(n) => self.content_length = Some(n),
                Err(_) => {
                    tracing::warn!(value = %header.value, "Couldn't parse content length")
                }
            }
        }

        self.write_line(&header.to_string()).await?;
        self.headers.push(header);
        Ok(())
    }

    pub async fn write_headers<I>(&mut self, headers: I) -> Result<()>
    where
        I: IntoIterator<Item = Header>,
    {
        for header in headers {
            self.write_header(header).await?;
        }
        Ok(())
    }

    /// Terminates the header block and restarts the body byte count.
    pub async fn end_headers(&mut self) -> Result<()> {
        self.write_line("").await?;
        self.out.reset_count();
        Ok(())
    }

    /// Writes `line` followed by CRLF.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.out.write_all(&encode_line(line)).await?;
        self.out.write_all(b"\r\n").await?;
        Ok(())
    }

    /// Sends a complete HTML error page and flushes. Only valid before
    /// anything else was written.
    pub async fn write_error(&mut self, status: StatusCode, details: &str) -> Result<()> {
        let page = format!(
            "<html><head><title>Error</title></head><body><p>{}</p></body></html>\r\n",
            escape_html(details)
        );

        self.write_status(status).await?;
        self.write_header(Header::new(header::CONTENT_TYPE, "text/html"))
            .await?;
        self.write_header(Header::new(header::CONTENT_LENGTH, page.len().to_string()))
            .await?;
        self.end_headers().await?;
        self.out.write_all(page.as_bytes()).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.out.flush().await?;
        Ok(())
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

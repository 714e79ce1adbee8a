use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{ProxyError, Result};
use crate::http::header::Header;
use crate::http::request::{Method, Request, Version};

/// Upper bound on a single request, status, header or chunk-size line.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Outcome of reading one line.
#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line without its terminator.
    Line(String),
    /// The stream ended before any byte of a new line was read.
    Eof,
}

/// Reads one line terminated by LF. A CR immediately before the LF is
/// dropped, and so is any bare CR elsewhere in the line. End of stream after
/// at least one byte is a protocol error.
///
/// Each byte becomes the char of the same value (ISO-8859-1), so
/// [`encode_line`] gives back exactly the bytes that were read.
pub async fn read_line<R>(reader: &mut R) -> Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = BytesMut::with_capacity(128);
    let mut read = 0usize;

    loop {
        let available = reader.fill_buf().await?;

        if available.is_empty() {
            if read == 0 {
                return Ok(LineRead::Eof);
            }
            return Err(ProxyError::protocol("end of stream while reading line"));
        }

        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => {
                put_without_cr(&mut line, &available[..i]);
                (i + 1, true)
            }
            None => {
                put_without_cr(&mut line, available);
                (available.len(), false)
            }
        };

        reader.consume(used);
        read += used;

        if done {
            break;
        }

        if line.len() > MAX_LINE_LEN {
            return Err(ProxyError::protocol("line too long"));
        }
    }

    Ok(LineRead::Line(line.iter().map(|&b| char::from(b)).collect()))
}

/// ISO-8859-1 bytes of a line read by [`read_line`]. Chars above U+00FF,
/// which only locally built text can contain, become `?`.
pub fn encode_line(line: &str) -> Vec<u8> {
    line.chars()
        .map(|c| u8::try_from(c).unwrap_or(b'?'))
        .collect()
}

fn put_without_cr(line: &mut BytesMut, bytes: &[u8]) {
    for &b in bytes.iter().filter(|&&b| b != b'\r') {
        line.put_u8(b);
    }
}

/// Reads header lines up to and including the empty line that ends them.
pub async fn read_headers<R>(reader: &mut R) -> Result<Vec<Header>>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Vec::new();

    loop {
        let line = match read_line(reader).await? {
            LineRead::Line(line) => line,
            LineRead::Eof => {
                return Err(ProxyError::protocol("connection closed while reading headers"));
            }
        };

        if line.is_empty() {
            break;
        }

        let header = Header::parse(&line)?;
        tracing::trace!(%header, "Read header");
        headers.push(header);
    }

    Ok(headers)
}

/// Splits `METHOD target VERSION`.
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if parts.len() != 3 {
        return Err(ProxyError::protocol(format!(
            "not enough parts in request line '{}'",
            line
        )));
    }

    if parts[0].is_empty() {
        return Err(ProxyError::protocol("empty request method"));
    }

    if parts[1].is_empty() {
        return Err(ProxyError::protocol("empty request URI"));
    }

    let version = Version::parse(parts[2])?;

    Ok((Method::parse(parts[0]), parts[1].to_string(), version))
}

/// Reads a request line and its headers, leaving the stream positioned at
/// the start of the body.
///
/// Returns `Ok(None)` when the peer closed the stream before sending any
/// byte, which is how clients end a kept-alive connection.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let line = match read_line(reader).await? {
        LineRead::Line(line) => line,
        LineRead::Eof => return Ok(None),
    };

    let (method, target, version) = parse_request_line(&line)?;
    tracing::debug!(%method, %target, %version, "Request");

    let headers = read_headers(reader).await?;

    Ok(Some(Request {
        method,
        target,
        version,
        headers,
    }))
}

/// A backend status line. Version and reason are relayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    pub code: u16,
    pub reason: Option<String>,
}

pub fn parse_status_line(line: &str) -> Result<StatusLine> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    // Reason phrase is optional
    if parts.len() < 2 {
        return Err(ProxyError::protocol(format!(
            "couldn't parse HTTP status '{}'",
            line
        )));
    }

    let code = parts[1]
        .parse::<u16>()
        .map_err(|_| ProxyError::protocol(format!("invalid status code in '{}'", line)))?;

    Ok(StatusLine {
        version: parts[0].to_string(),
        code,
        reason: parts.get(2).map(|s| s.to_string()),
    })
}

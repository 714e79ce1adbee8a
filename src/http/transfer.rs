//! Body framing: deciding how a message body is delimited and copying it
//! byte-for-byte from one stream to another.

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};
use crate::http::header::{self, Header};
use crate::http::parser::{LineRead, encode_line, read_line};

/// Copy buffer size.
pub const BUFFER_SIZE: usize = 8192;

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Chunked,
    Fixed(u64),
    None,
}

impl BodyLength {
    /// `Transfer-Encoding` other than `identity` wins over `Content-Length`;
    /// an unparsable `Content-Length` counts as absent.
    pub fn of(headers: &[Header]) -> Self {
        if header::is_chunked(headers) {
            BodyLength::Chunked
        } else if let Some(n) = header::content_length(headers) {
            BodyLength::Fixed(n)
        } else {
            BodyLength::None
        }
    }
}

/// Copies up to `count` bytes and returns how many were copied. Stops early
/// without error if the reader hits end of stream; callers that care about
/// truncation compare the return value.
pub async fn copy_fixed<R, W>(reader: &mut R, writer: &mut W, count: u64) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut remaining = count;

    while remaining > 0 {
        let want = remaining.min(BUFFER_SIZE as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;

        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }

    Ok(count - remaining)
}

/// Copies until the reader reaches end of stream.
pub async fn copy_to_eof<R, W>(reader: &mut R, writer: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    Ok(tokio::io::copy(reader, writer).await?)
}

/// Relays a chunked body verbatim: each size line (extensions included), the
/// chunk data and its CRLF, the zero-size last chunk and the trailer section
/// up to its terminating empty line.
pub async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let size_line = match read_line(reader).await? {
            LineRead::Line(line) => line,
            LineRead::Eof => {
                return Err(ProxyError::protocol(
                    "stream ended before chunked body was complete",
                ));
            }
        };

        let size = parse_chunk_size(&size_line)?;

        writer.write_all(&encode_line(&size_line)).await?;
        writer.write_all(b"\r\n").await?;

        if size == 0 {
            tracing::trace!("Got last chunk");
            copy_trailer(reader, writer).await?;
            return Ok(());
        }

        tracing::trace!(size, "Copying chunk");
        let copied = copy_fixed(reader, writer, size).await?;
        if copied != size {
            return Err(ProxyError::protocol(format!(
                "stream ended after {} of {} chunk bytes",
                copied, size
            )));
        }

        match read_line(reader).await? {
            LineRead::Line(line) if line.is_empty() => writer.write_all(b"\r\n").await?,
            LineRead::Line(_) => return Err(ProxyError::protocol("missing CRLF after chunk data")),
            LineRead::Eof => return Err(ProxyError::protocol("stream ended after chunk data")),
        }
    }
}

async fn copy_trailer<R, W>(reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = match read_line(reader).await? {
            LineRead::Line(line) => line,
            LineRead::Eof => return Err(ProxyError::protocol("stream ended in chunked trailer")),
        };

        writer.write_all(&encode_line(&line)).await?;
        writer.write_all(b"\r\n").await?;

        if line.is_empty() {
            return Ok(());
        }
    }
}

/// Hex size before any `;extension`.
pub fn parse_chunk_size(line: &str) -> Result<u64> {
    let digits = line.split(';').next().unwrap_or("").trim();

    u64::from_str_radix(digits, 16)
        .map_err(|_| ProxyError::protocol(format!("invalid chunk size line '{}'", line)))
}

/// Copies a body framed per `length`. Fixed bodies that end early are a
/// protocol error here, since the peer can no longer be trusted to frame the
/// next message.
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, length: BodyLength) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match length {
        BodyLength::Chunked => copy_chunked(reader, writer).await,
        BodyLength::Fixed(n) => {
            let copied = copy_fixed(reader, writer, n).await?;
            if copied != n {
                return Err(ProxyError::protocol(format!(
                    "stream ended after {} of {} body bytes",
                    copied, n
                )));
            }
            Ok(())
        }
        BodyLength::None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_ignores_extensions() {
        assert_eq!(parse_chunk_size("1a;name=value").unwrap(), 26);
        assert_eq!(parse_chunk_size(" FF ").unwrap(), 255);
        assert!(parse_chunk_size("zz").is_err());
        assert!(parse_chunk_size("").is_err());
    }

    #[test]
    fn transfer_encoding_beats_content_length() {
        let headers = vec![
            Header::new("Content-Length", "10"),
            Header::new("Transfer-Encoding", "chunked"),
        ];
        assert_eq!(BodyLength::of(&headers), BodyLength::Chunked);

        let headers = vec![
            Header::new("Content-Length", "10"),
            Header::new("Transfer-Encoding", "identity"),
        ];
        assert_eq!(BodyLength::of(&headers), BodyLength::Fixed(10));

        let headers = vec![Header::new("Content-Length", "ten")];
        assert_eq!(BodyLength::of(&headers), BodyLength::None);
    }

    #[tokio::test]
    async fn fixed_copy_stops_at_eof() {
        let mut input: &[u8] = b"short";
        let mut out = Vec::new();

        let copied = copy_fixed(&mut input, &mut out, 100).await.unwrap();
        assert_eq!(copied, 5);
        assert_eq!(out, b"short");
    }

    #[tokio::test]
    async fn fixed_copy_leaves_following_bytes() {
        let mut input: &[u8] = b"abcdefNEXT";
        let mut out = Vec::new();

        copy_fixed(&mut input, &mut out, 6).await.unwrap();
        assert_eq!(out, b"abcdef");
        assert_eq!(input, b"NEXT");
    }

    #[tokio::test]
    async fn chunked_copy_is_byte_exact() {
        let wire: &[u8] = b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\n\r\nNEXT";
        let mut input = wire;
        let mut out = Vec::new();

        copy_chunked(&mut input, &mut out).await.unwrap();

        assert_eq!(out, &wire[..wire.len() - 4]);
        assert_eq!(input, b"NEXT");
    }

    #[tokio::test]
    async fn chunked_copy_normalizes_bare_lf() {
        let mut input: &[u8] = b"3\nabc\n0\n\n";
        let mut out = Vec::new();

        copy_chunked(&mut input, &mut out).await.unwrap();
        assert_eq!(out, b"3\r\nabc\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn truncated_chunk_is_an_error() {
        let mut input: &[u8] = b"a\r\nabc";
        let mut out = Vec::new();

        assert!(copy_chunked(&mut input, &mut out).await.is_err());
    }

    #[tokio::test]
    async fn oversized_chunk_data_is_an_error() {
        let mut input: &[u8] = b"3\r\nabcXYZ\r\n0\r\n\r\n";
        let mut out = Vec::new();

        let err = copy_chunked(&mut input, &mut out).await.unwrap_err();
        assert!(err.to_string().contains("missing CRLF after chunk data"));
    }

    #[tokio::test]
    async fn bad_size_line_is_not_relayed() {
        let mut input: &[u8] = b"zz\r\n";
        let mut out = Vec::new();

        assert!(copy_chunked(&mut input, &mut out).await.is_err());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn chunk_extension_and_trailer_bytes_are_kept() {
        let wire: &[u8] = b"2;n=\xe9\r\nhi\r\n0\r\nX-T: \xff\x80\r\n\r\n";
        let mut input = wire;
        let mut out = Vec::new();

        copy_chunked(&mut input, &mut out).await.unwrap();
        assert_eq!(out, wire);
    }
}

//! Content-Length framing over async byte streams.
//!
//! Headers are ASCII lines terminated by `\r\n`; the block ends with an
//! empty line. `Content-Length` (decimal bytes) is mandatory; any other
//! header (`Content-Type` in practice) is ignored.

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Message;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads framed messages from a buffered stream.
pub struct MessageReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next message. `Ok(None)` means the stream ended cleanly at a
    /// frame boundary; EOF inside a frame is an error.
    pub async fn read(&mut self) -> ProtocolResult<Option<Message>> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut in_frame = false;

        loop {
            line.clear();
            let bytes = self.inner.read_line(&mut line).await?;
            if bytes == 0 {
                if in_frame {
                    return Err(ProtocolError::UnexpectedEof);
                }
                return Ok(None);
            }
            in_frame = true;

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }

            if let Some((name, value)) = trimmed.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    let value = value.trim();
                    content_length = Some(value.parse().map_err(|_| {
                        ProtocolError::InvalidContentLength(value.to_string())
                    })?);
                }
                // Content-Type and anything else: ignored.
            }
        }

        let length = content_length.ok_or(ProtocolError::MissingContentLength)?;

        let mut body = vec![0u8; length];
        self.inner.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::UnexpectedEof
            } else {
                ProtocolError::Io(e)
            }
        })?;

        Ok(Some(serde_json::from_slice(&body)?))
    }
}

/// Writes framed messages to a stream, flushing after each one.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write(&mut self, message: &Message) -> ProtocolResult<()> {
        let body = serde_json::to_vec(message)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.inner.write_all(header.as_bytes()).await?;
        self.inner.write_all(&body).await?;
        self.inner.flush().await?;

        Ok(())
    }
}

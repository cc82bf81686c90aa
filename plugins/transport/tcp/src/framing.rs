use tokio::io::{AsyncRead, AsyncReadExt};

use vitals_api::TransportError;

/// Newline-delimited frames. A trailing `\r` is stripped.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinesFraming {
    /// Maximum line length in bytes (0 = unlimited).
    max_length: usize,
}

impl LinesFraming {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Split one frame off the front of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed (newline included),
    /// or `None` when no complete line is buffered yet.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>, TransportError> {
        let pos = match buf.iter().position(|&b| b == b'\n') {
            Some(p) => p,
            None => {
                if self.max_length > 0 && buf.len() > self.max_length {
                    return Err(TransportError::format(format!(
                        "line too long: {} bytes (max {}) and no newline found",
                        buf.len(),
                        self.max_length
                    )));
                }
                return Ok(None);
            }
        };

        let consumed = pos + 1;
        let line = &buf[..pos];
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if self.max_length > 0 && line.len() > self.max_length {
            return Err(TransportError::format(format!(
                "line too long: {} bytes (max {})",
                line.len(),
                self.max_length
            )));
        }

        Ok(Some((line.to_vec(), consumed)))
    }

    pub fn encode(&self, data: &[u8], buf: &mut Vec<u8>) {
        buf.extend_from_slice(data);
        buf.push(b'\n');
    }
}

/// Buffered frame reader over one half of a connection.
pub struct FramedReader<R> {
    inner: R,
    framing: LinesFraming,
    buf: Vec<u8>,
    /// Set after an oversized line: drop bytes until the next newline.
    skipping: bool,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(inner: R, framing: LinesFraming) -> Self {
        Self {
            inner,
            framing,
            buf: Vec::with_capacity(4096),
            skipping: false,
        }
    }

    /// Next complete frame. `Ok(None)` on a clean EOF between frames.
    ///
    /// An oversized line is reported once as a `Format` error and then
    /// discarded, so the reader stays usable.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            if self.skipping {
                match self.buf.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        self.buf.drain(..=pos);
                        self.skipping = false;
                    }
                    None => self.buf.clear(),
                }
            }

            if !self.skipping {
                match self.framing.decode(&self.buf) {
                    Ok(Some((frame, consumed))) => {
                        self.buf.drain(..consumed);
                        return Ok(Some(frame));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.skipping = true;
                        return Err(e);
                    }
                }
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() || self.skipping {
                    return Ok(None);
                }
                return Err(TransportError::closed(format!(
                    "connection closed mid-frame ({} bytes buffered)",
                    self.buf.len()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_strips_crlf_and_reports_consumed() {
        let framing = LinesFraming::default();
        let (line, used) = framing.decode(b"{\"a\":1}\r\nrest").unwrap().unwrap();
        assert_eq!(line, b"{\"a\":1}");
        assert_eq!(used, 9);
        assert!(framing.decode(b"partial").unwrap().is_none());
    }

    #[test]
    fn decode_enforces_max_length() {
        let framing = LinesFraming::new(4);
        assert!(framing.decode(b"12345\n").is_err());
        assert!(framing.decode(b"123456").is_err());
        assert!(framing.decode(b"1234\n").unwrap().is_some());
    }

    #[test]
    fn encode_appends_newline() {
        let mut buf = Vec::new();
        LinesFraming::default().encode(b"x", &mut buf);
        assert_eq!(buf, b"x\n");
    }

    #[tokio::test]
    async fn reader_yields_frames_then_eof() {
        let data: &[u8] = b"one\ntwo\r\n";
        let mut reader = FramedReader::new(data, LinesFraming::default());
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"one");
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"two");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_reports_truncated_frame_as_closed() {
        let data: &[u8] = b"one\ntw";
        let mut reader = FramedReader::new(data, LinesFraming::default());
        reader.next_frame().await.unwrap();
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), vitals_api::ErrorKind::Closed);
    }

    #[tokio::test]
    async fn reader_recovers_after_oversized_line() {
        let data: &[u8] = b"far too long\nok\n";
        let mut reader = FramedReader::new(data, LinesFraming::new(4));
        let err = reader.next_frame().await.unwrap_err();
        assert_eq!(err.kind(), vitals_api::ErrorKind::Format);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), b"ok");
    }
}

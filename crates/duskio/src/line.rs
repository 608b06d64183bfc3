use bytes::Bytes;
use bytes::BytesMut;
use memchr::memchr;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

// JSON messages are small; a client sending more than this per line is
// either broken or hostile.
const DEFAULT_MAX_LINE: usize = 64 * 1024;

#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    max_line_len: usize,
}

impl<R> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            max_line_len: DEFAULT_MAX_LINE,
        }
    }

    pub fn max_line_len(mut self, max: usize) -> Self {
        self.max_line_len = max.max(1);
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Read one line, stripping the trailing `\n` and an optional `\r`.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` for a line (may be empty),
    /// - `Ok(None)` on clean EOF with no buffered data.
    pub async fn next_line(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if let Some(i) = memchr(b'\n', &self.buf) {
                let mut raw = self.buf.split_to(i + 1).freeze();
                let mut end = raw.len() - 1;
                if end > 0 && raw[end - 1] == b'\r' {
                    end -= 1;
                }
                raw.truncate(end);
                return Ok(Some(raw));
            }

            if self.buf.len() > self.max_line_len {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "line too long",
                ));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof while reading line",
                ));
            }
        }
    }
}

#[derive(Debug)]
pub struct LineWriter<W> {
    inner: W,
}

impl<W> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    /// Write one payload followed by `\n`.
    ///
    /// The payload must not itself contain `\n`; callers producing JSON via
    /// `serde_json::to_vec` never do.
    pub async fn write_line(&mut self, payload: &[u8]) -> std::io::Result<()> {
        debug_assert!(memchr(b'\n', payload).is_none());
        self.inner.write_all(payload).await?;
        self.inner.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_lf_and_crlf_lines() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            b.write_all(b"{\"type\":\"ping\"}\r\n{}\n").await.unwrap();
        });

        let mut lr = LineReader::new(a);
        let l1 = lr.next_line().await.unwrap().unwrap();
        let l2 = lr.next_line().await.unwrap().unwrap();
        assert_eq!(&l1[..], b"{\"type\":\"ping\"}");
        assert_eq!(&l2[..], b"{}");
        assert!(lr.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_oversized_line() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut b = b;
            let big = vec![b'x'; 256];
            let _ = b.write_all(&big).await;
        });

        let mut lr = LineReader::new(a).max_line_len(128);
        let err = lr.next_line().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn writer_round_trips() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut lw = LineWriter::new(b);
            lw.write_line(b"hello").await.unwrap();
            lw.flush().await.unwrap();
        });

        let mut lr = LineReader::new(a);
        let l = lr.next_line().await.unwrap().unwrap();
        assert_eq!(&l[..], b"hello");
    }
}

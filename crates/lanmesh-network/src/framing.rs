//! Wire Framing
//!
//! Two layers of framing wrap every channel:
//!
//! - On the raw TCP stream, all traffic is base64 text (legacy
//!   compatibility): each outbound chunk becomes one newline-terminated
//!   base64 line, and inbound lines are decoded before the bytes reach the
//!   TLS processor. [`Base64Framed`] implements this as an
//!   `AsyncRead + AsyncWrite` adapter.
//! - Inside the TLS stream, application traffic travels in [`Frame`]s:
//!   `kind(1) || len(4, BE) || payload`. Heartbeat request/response frames
//!   carry the liveness challenges; data frames carry one JSON message each.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Upper bound on a single frame payload
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Pending outbound bytes above which writes exert backpressure
const MAX_PENDING_OUT: usize = 1024 * 1024;

const FRAME_DATA: u8 = 0;
const FRAME_HEARTBEAT_REQUEST: u8 = 1;
const FRAME_HEARTBEAT_RESPONSE: u8 = 2;

/// One unit of traffic inside the TLS stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application bytes (one JSON message)
    Data(Vec<u8>),
    /// Liveness challenge
    HeartbeatRequest(Vec<u8>),
    /// Liveness echo
    HeartbeatResponse(Vec<u8>),
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::Data(_) => FRAME_DATA,
            Frame::HeartbeatRequest(_) => FRAME_HEARTBEAT_REQUEST,
            Frame::HeartbeatResponse(_) => FRAME_HEARTBEAT_RESPONSE,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Frame::Data(p) | Frame::HeartbeatRequest(p) | Frame::HeartbeatResponse(p) => p,
        }
    }
}

/// Write a frame and flush it out
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> io::Result<()> {
    let payload = frame.payload();
    let mut header = [0u8; 5];
    header[0] = frame.kind();
    header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    w.write_all(&header).await?;
    w.write_all(payload).await?;
    w.flush().await
}

/// Read the next frame; `None` on clean EOF at a frame boundary
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Frame>> {
    let mut header = [0u8; 5];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    match header[0] {
        FRAME_DATA => Ok(Some(Frame::Data(payload))),
        FRAME_HEARTBEAT_REQUEST => Ok(Some(Frame::HeartbeatRequest(payload))),
        FRAME_HEARTBEAT_RESPONSE => Ok(Some(Frame::HeartbeatResponse(payload))),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame kind {other}"),
        )),
    }
}

/// Base64 adapter over a byte stream. Everything crossing the inner stream
/// is newline-delimited base64 text; callers see the decoded bytes.
pub struct Base64Framed<S> {
    inner: S,
    /// Undecoded inbound bytes (partial lines)
    raw_in: Vec<u8>,
    /// Decoded bytes not yet handed to the reader
    decoded: VecDeque<u8>,
    /// Encoded outbound bytes not yet accepted by the inner stream
    out: VecDeque<u8>,
}

impl<S> Base64Framed<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            raw_in: Vec::new(),
            decoded: VecDeque::new(),
            out: VecDeque::new(),
        }
    }

    fn decode_lines(&mut self) -> io::Result<()> {
        while let Some(nl) = self.raw_in.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.raw_in.drain(..=nl).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            let chunk = BASE64
                .decode(line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.decoded.extend(chunk);
        }
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Base64Framed<S> {
    fn poll_drain_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.out.is_empty() {
            let (front, _) = self.out.as_slices();
            match Pin::new(&mut self.inner).poll_write(cx, front) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => {
                    self.out.drain(..n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for Base64Framed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.decoded.is_empty() {
                let n = buf.remaining().min(this.decoded.len());
                for byte in this.decoded.drain(..n) {
                    buf.put_slice(&[byte]);
                }
                return Poll::Ready(Ok(()));
            }

            let mut tmp = [0u8; 4096];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.inner).poll_read(cx, &mut tmp_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {
                    let filled = tmp_buf.filled();
                    if filled.is_empty() {
                        // EOF; a partial trailing line dies with the socket
                        return Poll::Ready(Ok(()));
                    }
                    this.raw_in.extend_from_slice(filled);
                    this.decode_lines()?;
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for Base64Framed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.out.len() > MAX_PENDING_OUT {
            match this.poll_drain_out(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    if this.out.len() > MAX_PENDING_OUT {
                        return Poll::Pending;
                    }
                }
            }
        }

        this.out.extend(BASE64.encode(buf).into_bytes());
        this.out.push_back(b'\n');
        // opportunistic drain; leftovers go out on flush
        match this.poll_drain_out(cx) {
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            _ => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain_out(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_drain_out(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_base64_round_trip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut framed_a = Base64Framed::new(a);
        let mut framed_b = Base64Framed::new(b);

        framed_a.write_all(b"hello mesh").await.unwrap();
        framed_a.flush().await.unwrap();

        let mut buf = [0u8; 10];
        framed_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello mesh");
    }

    #[tokio::test]
    async fn test_only_base64_crosses_the_wire() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let mut framed = Base64Framed::new(a);

        framed.write_all(&[0x00, 0xff, 0x80, 0x7f]).await.unwrap();
        framed.flush().await.unwrap();

        let mut raw = [0u8; 64];
        let n = b.read(&mut raw).await.unwrap();
        let text = std::str::from_utf8(&raw[..n]).unwrap();
        assert!(text.ends_with('\n'));
        let line = text.trim_end();
        assert_eq!(BASE64.decode(line).unwrap(), vec![0x00, 0xff, 0x80, 0x7f]);
    }

    #[tokio::test]
    async fn test_split_lines_reassemble() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut framed_a = Base64Framed::new(a);
        let mut framed_b = Base64Framed::new(b);

        for chunk in [b"abc".as_slice(), b"defgh", b"i"] {
            framed_a.write_all(chunk).await.unwrap();
        }
        framed_a.flush().await.unwrap();

        let mut buf = [0u8; 9];
        framed_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcdefghi");
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);

        let frames = [
            Frame::Data(b"payload".to_vec()),
            Frame::HeartbeatRequest(vec![1; 16]),
            Frame::HeartbeatResponse(vec![2; 16]),
        ];
        for frame in &frames {
            write_frame(&mut a, frame).await.unwrap();
        }
        drop(a);

        for expected in &frames {
            let got = read_frame(&mut b).await.unwrap().unwrap();
            assert_eq!(&got, expected);
        }
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}

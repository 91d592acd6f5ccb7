//! Wire framing for peer connections.
//!
//! Every frame on a peer stream is
//! `[MsgHeader: 40][body: N][MSG_BOUNDARY: 16]`:
//!
//! - **header**: two reference ids (`response_to`, `notify`), the body
//!   length (little-endian u32) and a CRC32C of the body
//! - **body**: one encoded [`Message`](crate::message::Message), opaque to
//!   this layer
//! - **boundary**: a fixed sentinel written after every frame and scanned
//!   for when a body fails to decode, so one corrupt payload never
//!   desynchronizes the stream
//!
//! A fresh connection starts with a handshake written by the side that
//! opened it: the cluster cookie ([`COOKIE_LEN`] raw bytes), then a
//! NUL-padded version string of [`VERSION_LEN`] bytes. The acceptor
//! verifies the cookie (full-length compare, any mismatch is fatal) and
//! records the version; version skew is advisory only.

use bytes::Bytes;
use procmesh_core::{Cookie, Rrid, COOKIE_LEN, RRID_WIRE_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reader half of a peer stream, boxed for manager independence.
pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;

/// Writer half of a peer stream, boxed for manager independence.
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Width of the NUL-padded version string in the handshake.
pub const VERSION_LEN: usize = 16;

/// Encoded width of a frame header.
pub const HEADER_LEN: usize = 2 * RRID_WIRE_LEN + 8;

/// Maximum accepted body size (1 MiB).
///
/// Larger lengths are treated as a decode fault: the header was read, the
/// body is not trusted, and the reader resynchronizes to the boundary.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Sentinel terminating every frame.
///
/// The first byte occurs nowhere else in the pattern, so the resync
/// scanner can reset to a single candidate position on mismatch.
pub const MSG_BOUNDARY: [u8; 16] = *b"\x01pmesh-frame-end";

/// Wire-level error type.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The presented cookie did not match the cluster cookie.
    #[error("handshake cookie mismatch")]
    CookieMismatch,

    /// The bytes after a frame body were not the boundary sentinel.
    #[error("missing frame boundary")]
    BadBoundary,

    /// Header announced a body larger than [`MAX_BODY_SIZE`].
    #[error("frame body too large: {size} bytes")]
    BodyTooLarge {
        /// The announced body size.
        size: usize,
    },

    /// Body bytes did not match the header checksum.
    #[error("body checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum from the header.
        expected: u32,
        /// Checksum computed over the received body.
        actual: u32,
    },

    /// The peer closed the stream.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Underlying stream failure.
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Whether this failure is scoped to one frame's body.
    ///
    /// Decode faults leave the stream recoverable: the dispatcher reports
    /// the fault to the frame's reference ids and resynchronizes to the
    /// next boundary. Everything else kills the connection.
    pub fn is_decode_fault(&self) -> bool {
        matches!(
            self,
            WireError::BodyTooLarge { .. } | WireError::ChecksumMismatch { .. }
        )
    }
}

/// Frame header: reply addressing plus body length and checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Where the producer stores the result ([`Rrid::NULL`] for none).
    pub response_to: Rrid,
    /// Where the initiator awaits the result ([`Rrid::NULL`] for none).
    pub notify: Rrid,
    /// Body length in bytes.
    pub body_len: u32,
    /// CRC32C over the body bytes.
    pub body_crc: u32,
}

impl MsgHeader {
    /// Encode into the fixed-width wire form.
    pub fn to_wire(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..RRID_WIRE_LEN].copy_from_slice(&self.response_to.to_wire());
        buf[RRID_WIRE_LEN..2 * RRID_WIRE_LEN].copy_from_slice(&self.notify.to_wire());
        buf[32..36].copy_from_slice(&self.body_len.to_le_bytes());
        buf[36..40].copy_from_slice(&self.body_crc.to_le_bytes());
        buf
    }

    /// Decode from the fixed-width wire form.
    pub fn from_wire(buf: &[u8; HEADER_LEN]) -> Self {
        let mut rrid = [0u8; RRID_WIRE_LEN];
        rrid.copy_from_slice(&buf[0..RRID_WIRE_LEN]);
        let response_to = Rrid::from_wire(&rrid);
        rrid.copy_from_slice(&buf[RRID_WIRE_LEN..2 * RRID_WIRE_LEN]);
        let notify = Rrid::from_wire(&rrid);
        Self {
            response_to,
            notify,
            body_len: u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]),
            body_crc: u32::from_le_bytes([buf[36], buf[37], buf[38], buf[39]]),
        }
    }
}

/// Reading half of a framed peer connection.
pub struct FrameReader {
    stream: BoxRead,
}

impl FrameReader {
    /// Wrap a stream reader.
    pub fn new(stream: BoxRead) -> Self {
        Self { stream }
    }

    /// Read and verify the connection handshake; returns the peer version.
    ///
    /// # Errors
    ///
    /// [`WireError::CookieMismatch`] closes the connection; the caller must
    /// not read further.
    pub async fn read_handshake(&mut self, cookie: &Cookie) -> Result<String, WireError> {
        let mut presented = [0u8; COOKIE_LEN];
        read_exact(&mut self.stream, &mut presented).await?;
        if !cookie.matches(&presented) {
            return Err(WireError::CookieMismatch);
        }
        let mut version = [0u8; VERSION_LEN];
        read_exact(&mut self.stream, &mut version).await?;
        let end = version
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(VERSION_LEN);
        Ok(String::from_utf8_lossy(&version[..end]).into_owned())
    }

    /// Read one frame header.
    pub async fn read_header(&mut self) -> Result<MsgHeader, WireError> {
        let mut buf = [0u8; HEADER_LEN];
        read_exact(&mut self.stream, &mut buf).await?;
        Ok(MsgHeader::from_wire(&buf))
    }

    /// Read the body announced by `header`, verifying its checksum.
    ///
    /// # Errors
    ///
    /// [`WireError::BodyTooLarge`] and [`WireError::ChecksumMismatch`] are
    /// decode faults (see [`WireError::is_decode_fault`]); note that for
    /// `BodyTooLarge` no body bytes have been consumed.
    pub async fn read_body(&mut self, header: &MsgHeader) -> Result<Bytes, WireError> {
        let size = header.body_len as usize;
        if size > MAX_BODY_SIZE {
            return Err(WireError::BodyTooLarge { size });
        }
        let mut body = vec![0u8; size];
        read_exact(&mut self.stream, &mut body).await?;
        let actual = crc32c::crc32c(&body);
        if actual != header.body_crc {
            return Err(WireError::ChecksumMismatch {
                expected: header.body_crc,
                actual,
            });
        }
        Ok(Bytes::from(body))
    }

    /// Read the boundary expected after a well-formed body.
    pub async fn read_boundary(&mut self) -> Result<(), WireError> {
        let mut buf = [0u8; MSG_BOUNDARY.len()];
        read_exact(&mut self.stream, &mut buf).await?;
        if buf != MSG_BOUNDARY {
            return Err(WireError::BadBoundary);
        }
        Ok(())
    }

    /// Scan forward byte by byte until a boundary sentinel is consumed.
    ///
    /// Used after a body decode fault to drop the remainder of the corrupt
    /// frame. The next read after a successful resync sees the following
    /// frame's header.
    pub async fn resync_to_boundary(&mut self) -> Result<(), WireError> {
        let mut matched = 0usize;
        loop {
            let mut byte = [0u8; 1];
            read_exact(&mut self.stream, &mut byte).await?;
            if byte[0] == MSG_BOUNDARY[matched] {
                matched += 1;
                if matched == MSG_BOUNDARY.len() {
                    return Ok(());
                }
            } else {
                // The sentinel's first byte appears only at offset 0, so a
                // failed match can only restart there.
                matched = usize::from(byte[0] == MSG_BOUNDARY[0]);
            }
        }
    }
}

/// Writing half of a framed peer connection.
pub struct FrameWriter {
    stream: BoxWrite,
}

impl FrameWriter {
    /// Wrap a stream writer.
    pub fn new(stream: BoxWrite) -> Self {
        Self { stream }
    }

    /// Write the connection handshake (initiator side).
    pub async fn write_handshake(
        &mut self,
        cookie: &Cookie,
        version: &str,
    ) -> Result<(), WireError> {
        self.stream.write_all(cookie.as_bytes()).await?;
        let mut padded = [0u8; VERSION_LEN];
        let bytes = version.as_bytes();
        let n = bytes.len().min(VERSION_LEN);
        padded[..n].copy_from_slice(&bytes[..n]);
        self.stream.write_all(&padded).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write one complete frame: header, body, boundary.
    pub async fn write_frame(
        &mut self,
        response_to: Rrid,
        notify: Rrid,
        body: &[u8],
    ) -> Result<(), WireError> {
        if body.len() > MAX_BODY_SIZE {
            return Err(WireError::BodyTooLarge { size: body.len() });
        }
        let header = MsgHeader {
            response_to,
            notify,
            body_len: body.len() as u32,
            body_crc: crc32c::crc32c(body),
        };
        self.stream.write_all(&header.to_wire()).await?;
        self.stream.write_all(body).await?;
        self.stream.write_all(&MSG_BOUNDARY).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush and close the stream.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// `read_exact` that reports EOF as [`WireError::ConnectionClosed`].
async fn read_exact(stream: &mut BoxRead, buf: &mut [u8]) -> Result<(), WireError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::ConnectionClosed),
        Err(e) => Err(WireError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procmesh_core::Cookie;

    fn pair() -> (FrameReader, FrameWriter) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (read, _) = tokio::io::split(a);
        let (_, write) = tokio::io::split(b);
        (
            FrameReader::new(Box::new(read)),
            FrameWriter::new(Box::new(write)),
        )
    }

    #[test]
    fn test_header_roundtrip() {
        let header = MsgHeader {
            response_to: Rrid::new(2, 99, 1),
            notify: Rrid::NULL,
            body_len: 512,
            body_crc: 0xDEADBEEF,
        };
        let decoded = MsgHeader::from_wire(&header.to_wire());
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_boundary_first_byte_is_unique() {
        // The resync scanner depends on this property.
        assert!(!MSG_BOUNDARY[1..].contains(&MSG_BOUNDARY[0]));
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut reader, mut writer) = pair();
        let response_to = Rrid::new(1, 7, 0);
        let notify = Rrid::new(2, 8, 0);

        writer
            .write_frame(response_to, notify, b"hello frame")
            .await
            .expect("write");

        let header = reader.read_header().await.expect("header");
        assert_eq!(header.response_to, response_to);
        assert_eq!(header.notify, notify);
        let body = reader.read_body(&header).await.expect("body");
        assert_eq!(&body[..], b"hello frame");
        reader.read_boundary().await.expect("boundary");
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let (mut reader, mut writer) = pair();
        let cookie = Cookie::from_bytes(*b"0123456789abcdef");

        writer
            .write_handshake(&cookie, "0.3.1")
            .await
            .expect("write handshake");

        let version = reader.read_handshake(&cookie).await.expect("handshake");
        assert_eq!(version, "0.3.1");
    }

    #[tokio::test]
    async fn test_handshake_cookie_mismatch() {
        let (mut reader, mut writer) = pair();
        let ours = Cookie::from_bytes(*b"0123456789abcdef");
        let theirs = Cookie::from_bytes(*b"fedcba9876543210");

        writer
            .write_handshake(&theirs, "0.3.1")
            .await
            .expect("write handshake");

        let result = reader.read_handshake(&ours).await;
        assert!(matches!(result, Err(WireError::CookieMismatch)));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_decode_fault() {
        let (mut reader, mut writer) = pair();

        // Hand-build a frame whose checksum lies about the body.
        let header = MsgHeader {
            response_to: Rrid::NULL,
            notify: Rrid::NULL,
            body_len: 4,
            body_crc: 0,
        };
        writer.stream.write_all(&header.to_wire()).await.expect("h");
        writer.stream.write_all(b"ruin").await.expect("b");
        writer.stream.write_all(&MSG_BOUNDARY).await.expect("s");
        writer.stream.flush().await.expect("flush");

        let header = reader.read_header().await.expect("header");
        let err = reader.read_body(&header).await.err().expect("must fail");
        assert!(err.is_decode_fault());
        // Recovery path: scan to the boundary, stream is clean again.
        reader.resync_to_boundary().await.expect("resync");
    }

    #[tokio::test]
    async fn test_resync_skips_garbage_and_partial_matches() {
        let (mut reader, mut writer) = pair();

        // Garbage that includes a partial sentinel prefix, then a real one,
        // then a full valid frame.
        writer.stream.write_all(b"junk").await.expect("w");
        writer
            .stream
            .write_all(&MSG_BOUNDARY[..5])
            .await
            .expect("w");
        writer.stream.write_all(b"more junk").await.expect("w");
        writer.stream.write_all(&MSG_BOUNDARY).await.expect("w");
        writer
            .write_frame(Rrid::NULL, Rrid::new(1, 1, 0), b"ok")
            .await
            .expect("write frame");

        reader.resync_to_boundary().await.expect("resync");
        let header = reader.read_header().await.expect("header");
        let body = reader.read_body(&header).await.expect("body");
        assert_eq!(&body[..], b"ok");
        reader.read_boundary().await.expect("boundary");
    }

    #[tokio::test]
    async fn test_resync_eof_reports_closed() {
        let (mut reader, mut writer) = pair();
        writer.stream.write_all(b"never a boundary").await.expect("w");
        writer.shutdown().await;
        drop(writer);

        let err = reader.resync_to_boundary().await.err().expect("must fail");
        assert!(matches!(err, WireError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_oversize_body_rejected_before_read() {
        let (mut reader, mut writer) = pair();
        let header = MsgHeader {
            response_to: Rrid::NULL,
            notify: Rrid::NULL,
            body_len: (MAX_BODY_SIZE + 1) as u32,
            body_crc: 0,
        };
        writer.stream.write_all(&header.to_wire()).await.expect("h");
        writer.stream.flush().await.expect("flush");

        let header = reader.read_header().await.expect("header");
        let err = reader.read_body(&header).await.err().expect("must fail");
        assert!(matches!(err, WireError::BodyTooLarge { .. }));
        assert!(err.is_decode_fault());
    }
}

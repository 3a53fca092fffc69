use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// First byte of every frame on the game wire.
pub const MAGIC: u8 = 0xFF;

/// Header: magic + code + u16 LE total length.
pub const HEADER_LEN: usize = 4;

/// One decoded frame: the command code plus its payload (header stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameFrame {
    pub code: u8,
    pub payload: Bytes,
}

/// Stateful splitter for the game wire.
///
/// Feed raw reads in, pull complete frames out. A trailing partial frame stays
/// buffered until the next feed. Pure, no I/O; the async reader below wraps it.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    buf: BytesMut,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame, if one is fully buffered.
    ///
    /// Errors when the buffered data does not start with the frame magic or the
    /// declared length is shorter than the header; both mean the stream is
    /// unrecoverably out of sync.
    pub fn next_frame(&mut self) -> std::io::Result<Option<GameFrame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        if self.buf[0] != MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame does not start with 0xFF",
            ));
        }
        let total = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
        if total < HEADER_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame length shorter than header",
            ));
        }
        if self.buf.len() < total {
            return Ok(None);
        }
        let code = self.buf[1];
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(total - HEADER_LEN).freeze();
        Ok(Some(GameFrame { code, payload }))
    }
}

#[derive(Debug)]
pub struct GameFrameReader<R> {
    inner: R,
    splitter: FrameSplitter,
    scratch: BytesMut,
}

impl<R> GameFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            splitter: FrameSplitter::new(),
            scratch: BytesMut::with_capacity(4 * 1024),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> GameFrameReader<R> {
    /// Read one raw byte, bypassing the splitter.
    ///
    /// The game client opens every connection with a bare `0x01` ping before
    /// any framed traffic; the handshake consumes it through here.
    pub async fn read_ping_byte(&mut self) -> std::io::Result<Option<u8>> {
        let mut b = [0u8; 1];
        match self.inner.read_exact(&mut b).await {
            Ok(_) => Ok(Some(b[0])),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read one frame.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` for a complete frame,
    /// - `Ok(None)` on clean EOF with no buffered partial frame.
    pub async fn read_frame(&mut self) -> std::io::Result<Option<GameFrame>> {
        loop {
            if let Some(frame) = self.splitter.next_frame()? {
                return Ok(Some(frame));
            }

            self.scratch.clear();
            let n = self.inner.read_buf(&mut self.scratch).await?;
            if n == 0 {
                if self.splitter.buffered() == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof mid-frame",
                ));
            }
            self.splitter.feed(&self.scratch);
        }
    }
}

#[derive(Debug)]
pub struct GameFrameWriter<W> {
    inner: W,
}

impl<W> GameFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> GameFrameWriter<W> {
    pub async fn write_frame(&mut self, code: u8, payload: &[u8]) -> std::io::Result<()> {
        self.write_frame_parts(code, &[payload]).await
    }

    /// Write a frame without concatenating payload parts first.
    pub async fn write_frame_parts(&mut self, code: u8, parts: &[&[u8]]) -> std::io::Result<()> {
        let body: usize = parts.iter().map(|p| p.len()).sum();
        let total: u16 = (HEADER_LEN + body).try_into().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too big for u16 wire")
        })?;

        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_u8(MAGIC);
        header.put_u8(code);
        header.put_u16_le(total);
        self.inner.write_all(&header).await?;
        for p in parts {
            if !p.is_empty() {
                self.inner.write_all(p).await?;
            }
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

/// Build one frame as a standalone byte vector. Handy for tests and for the
/// redirect paths that splice frames into foreign streams.
pub fn encode_frame(code: u8, payload: &[u8]) -> Vec<u8> {
    let total = (HEADER_LEN + payload.len()) as u16;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(MAGIC);
    out.push(code);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_concatenated_frames() {
        let mut s = FrameSplitter::new();
        let mut wire = encode_frame(30, b"DESKTOP-1337ISH\0User\0");
        wire.extend_from_slice(&encode_frame(21, &[1, 0, 0, 0]));
        s.feed(&wire);

        let a = s.next_frame().unwrap().unwrap();
        assert_eq!(a.code, 30);
        assert_eq!(&a.payload[..], b"DESKTOP-1337ISH\0User\0");
        let b = s.next_frame().unwrap().unwrap();
        assert_eq!(b.code, 21);
        assert_eq!(&b.payload[..], &[1, 0, 0, 0]);
        assert!(s.next_frame().unwrap().is_none());
    }

    #[test]
    fn buffers_partial_tail_across_feeds() {
        let mut s = FrameSplitter::new();
        let wire = encode_frame(6, b"68XIPSID\x03\x00\x00\x00");
        s.feed(&wire[..7]);
        assert!(s.next_frame().unwrap().is_none());
        s.feed(&wire[7..]);
        let f = s.next_frame().unwrap().unwrap();
        assert_eq!(f.code, 6);
        assert_eq!(&f.payload[..], b"68XIPSID\x03\x00\x00\x00");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut s = FrameSplitter::new();
        s.feed(&[0x01, 0x06, 0x04, 0x00]);
        assert!(s.next_frame().is_err());
    }

    #[test]
    fn rejects_undersized_length_field() {
        let mut s = FrameSplitter::new();
        s.feed(&[0xFF, 0x06, 0x03, 0x00]);
        assert!(s.next_frame().is_err());
    }

    #[tokio::test]
    async fn round_trips_over_duplex() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut fw = GameFrameWriter::new(b);
            fw.write_frame(9, &[]).await.unwrap();
            fw.write_frame_parts(15, &[&[4, 0, 0, 0], b"mage\0hi\0"])
                .await
                .unwrap();
            fw.flush().await.unwrap();
        });

        let mut fr = GameFrameReader::new(a);
        let f = fr.read_frame().await.unwrap().unwrap();
        assert_eq!((f.code, f.payload.len()), (9, 0));
        let f = fr.read_frame().await.unwrap().unwrap();
        assert_eq!(f.code, 15);
        assert_eq!(&f.payload[..], b"\x04\x00\x00\x00mage\0hi\0");
        assert!(fr.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ping_byte_then_frames() {
        let (a, mut b) = tokio::io::duplex(64);
        b.write_all(&[0x01]).await.unwrap();
        b.write_all(&encode_frame(21, &[])).await.unwrap();

        let mut fr = GameFrameReader::new(a);
        assert_eq!(fr.read_ping_byte().await.unwrap(), Some(0x01));
        let f = fr.read_frame().await.unwrap().unwrap();
        assert_eq!(f.code, 21);
    }

    #[test]
    fn every_emitted_frame_declares_its_own_length() {
        let wire = encode_frame(76, &[1, 0, 0, 0]);
        assert_eq!(wire[0], MAGIC);
        assert_eq!(u16::from_le_bytes([wire[2], wire[3]]) as usize, wire.len());
    }
}

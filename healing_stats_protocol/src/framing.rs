// Length-delimited message framing over a byte stream.
//
// Each encoded `Message` travels in a frame: a 4-byte little-endian length
// prefix followed by the message bytes. Framing only recovers message
// boundaries; validating the bytes inside a frame is `message.rs`'s job, so
// a zero-length frame is delivered as an empty buffer and rejected there as
// a short header.
//
// Two read paths:
// - `read_frame` blocks on any `Read` (tests and simple tools).
// - `FrameDecoder` is fed whatever bytes the socket (or the TLS session)
//   handed over and yields complete frames. The relay's link pumps use it
//   because a frame may arrive split across several reads, and one read may
//   carry many frames. Consumed bytes are skipped by offset and compacted
//   away once per `extend`, so a large read costs linear time.
//
// `MAX_FRAME_SIZE` bounds allocation from malformed length prefixes. The
// largest legitimate message is a RegisterSelf/AddPeer with a 255-byte name.

use std::io::{self, Read, Write};

/// Maximum allowed frame payload size.
pub const MAX_FRAME_SIZE: u32 = 4096;

/// Length prefix size.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Frame `msg` into a fresh buffer: 4-byte little-endian length, then payload.
pub fn frame(msg: &[u8]) -> io::Result<Vec<u8>> {
    let len = checked_len(msg)?;
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + msg.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(msg);
    Ok(out)
}

/// Write a length-delimited frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, msg: &[u8]) -> io::Result<()> {
    let len = checked_len(msg)?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(msg)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-delimited frame.
///
/// Returns `UnexpectedEof` if the stream closes before or during a frame.
/// Returns `InvalidData` if the length exceeds `MAX_FRAME_SIZE`.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(oversized(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Incremental frame reassembly for partial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Start of the first byte not yet returned in a frame.
    start: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let pending = &self.buf[self.start..];
        if pending.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes([pending[0], pending[1], pending[2], pending[3]]);
        if len > MAX_FRAME_SIZE {
            return Err(oversized(len));
        }
        let end = FRAME_HEADER_SIZE + len as usize;
        if pending.len() < end {
            return Ok(None);
        }
        let frame = pending[FRAME_HEADER_SIZE..end].to_vec();
        self.start += end;
        Ok(Some(frame))
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }
}

fn checked_len(msg: &[u8]) -> io::Result<u32> {
    match u32::try_from(msg.len()) {
        Ok(len) if len <= MAX_FRAME_SIZE => Ok(len),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame too large: {} bytes (max {MAX_FRAME_SIZE})", msg.len()),
        )),
    }
}

fn oversized(len: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame too large: {len} bytes (max {MAX_FRAME_SIZE})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn blocking_read_recovers_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello, relay!").unwrap();
        assert_eq!(&buf[..4], &[13, 0, 0, 0]);

        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"hello, relay!");
    }

    #[test]
    fn truncated_stream_is_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"some data").unwrap();
        buf.truncate(6);

        let mut cursor = Cursor::new(&buf);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_frame_rejected_on_write_and_read() {
        let big = vec![0u8; MAX_FRAME_SIZE as usize + 1];
        let err = frame(&big).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let wire = (MAX_FRAME_SIZE + 1).to_le_bytes();
        let err = read_frame(&mut Cursor::new(&wire)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decoder_handles_split_and_coalesced_frames() {
        let mut wire = frame(b"first").unwrap();
        wire.extend(frame(b"").unwrap());
        wire.extend(frame(b"third").unwrap());

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(3) {
            decoder.extend(chunk);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![b"first".to_vec(), Vec::new(), b"third".to_vec()]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_consumes_a_full_read_by_offset() {
        let payload = [7u8; 74];
        let mut wire = Vec::new();
        for _ in 0..200 {
            wire.extend(frame(&payload).unwrap());
        }
        let tail = frame(b"tail").unwrap();
        wire.extend_from_slice(&tail[..3]);

        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire);
        let mut count = 0;
        while let Some(frame) = decoder.next_frame().unwrap() {
            assert_eq!(frame, payload);
            count += 1;
        }
        assert_eq!(count, 200);
        assert_eq!(decoder.buffered(), 3);
        // Nothing has been moved yet; the next extend compacts once.
        assert_eq!(decoder.buf.len(), wire.len());

        decoder.extend(&tail[3..]);
        assert_eq!(decoder.start, 0);
        assert_eq!(decoder.buf, tail);
        assert_eq!(decoder.next_frame().unwrap(), Some(b"tail".to_vec()));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_rejects_oversized_prefix() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&u32::MAX.to_le_bytes());
        assert!(decoder.next_frame().is_err());
    }
}

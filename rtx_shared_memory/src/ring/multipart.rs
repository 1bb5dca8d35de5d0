//! Multipart discipline: one record carries one message made of frames.
//!
//! Each frame is a 16 byte [`FrameHeader`] followed by its payload padded to
//! 8 bytes. All frames but the last carry [`FrameFlags::MORE`]; the last one
//! carries [`FrameFlags::EOR`].

use super::record::{RecordReader, RecordWriter};
use crate::error::{ShmError, ShmResult};
use bitflags::bitflags;

bitflags! {
    /// Per-frame flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u16 {
        /// Another frame of the same message follows.
        const MORE = 1 << 0;
        /// Last frame of the message.
        const EOR = 1 << 1;
    }
}

const FRAME_HEADER: usize = 16;

/// Frame header as stored in the record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    size: u32,
    msgid: u32,
    format: u16,
    flags: u16,
    _pad: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<FrameHeader>(), FRAME_HEADER);

impl FrameHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.msgid.to_le_bytes());
        out.extend_from_slice(&self.format.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
    }

    fn decode(b: &[u8]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        Self {
            size: u32_at(0),
            msgid: u32_at(4),
            format: u16::from_le_bytes([b[8], b[9]]),
            flags: u16::from_le_bytes([b[10], b[11]]),
            _pad: 0,
        }
    }
}

/// A borrowed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    /// Application message id.
    pub msgid: u32,
    /// Application payload format.
    pub format: u16,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Payload.
    pub data: &'a [u8],
}

/// An owned frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Application message id.
    pub msgid: u32,
    /// Application payload format.
    pub format: u16,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Payload.
    pub data: Vec<u8>,
}

impl From<FrameRef<'_>> for Frame {
    fn from(f: FrameRef<'_>) -> Self {
        Self {
            msgid: f.msgid,
            format: f.format,
            flags: f.flags,
            data: f.data.to_vec(),
        }
    }
}

/// Split a multipart record into its frames.
pub fn parse_frames(record: &[u8]) -> ShmResult<Vec<FrameRef<'_>>> {
    let mut frames = Vec::new();
    let mut off = 0;
    while off < record.len() {
        if record.len() - off < FRAME_HEADER {
            return Err(invalid("truncated frame header"));
        }
        let hdr = FrameHeader::decode(&record[off..off + FRAME_HEADER]);
        let start = off + FRAME_HEADER;
        let end = start + hdr.size as usize;
        if end > record.len() {
            return Err(invalid("frame exceeds record"));
        }
        let flags = FrameFlags::from_bits_truncate(hdr.flags);
        frames.push(FrameRef {
            msgid: hdr.msgid,
            format: hdr.format,
            flags,
            data: &record[start..end],
        });
        off = start + (hdr.size as usize).next_multiple_of(8);
        if flags.contains(FrameFlags::EOR) {
            break;
        }
        if !flags.contains(FrameFlags::MORE) {
            return Err(invalid("frame without MORE or EOR"));
        }
    }
    match frames.last() {
        Some(f) if f.flags.contains(FrameFlags::EOR) => Ok(frames),
        _ => Err(invalid("message without end-of-record frame")),
    }
}

fn invalid(reason: &str) -> ShmError {
    ShmError::InvalidRing {
        reason: reason.to_string(),
    }
}

/// Collects frames and writes them as one record on commit.
pub struct MultipartWriter<'a> {
    inner: RecordWriter<'a>,
    buf: Vec<u8>,
    last_header: Option<usize>,
    frames: usize,
}

impl<'a> MultipartWriter<'a> {
    pub(crate) fn new(inner: RecordWriter<'a>) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            last_header: None,
            frames: 0,
        }
    }

    /// Queue a frame of the pending message.
    pub fn add_frame(&mut self, data: &[u8], msgid: u32, format: u16) -> &mut Self {
        if let Some(prev) = self.last_header {
            let flags = FrameFlags::MORE.bits().to_le_bytes();
            self.buf[prev + 10..prev + 12].copy_from_slice(&flags);
        }
        self.last_header = Some(self.buf.len());
        FrameHeader {
            size: data.len() as u32,
            msgid,
            format,
            flags: FrameFlags::EOR.bits(),
            _pad: 0,
        }
        .encode(&mut self.buf);
        self.buf.extend_from_slice(data);
        self.buf.resize(self.buf.len().next_multiple_of(8), 0);
        self.frames += 1;
        self
    }

    /// Frames queued so far.
    pub fn pending_frames(&self) -> usize {
        self.frames
    }

    /// Write the pending message. On `WouldBlock` the frames stay queued.
    pub fn commit(&mut self) -> ShmResult<()> {
        if self.frames == 0 {
            return Err(invalid("commit without frames"));
        }
        self.inner.write(&self.buf)?;
        self.abort();
        Ok(())
    }

    /// Drop the pending message.
    pub fn abort(&mut self) {
        self.buf.clear();
        self.last_header = None;
        self.frames = 0;
    }
}

/// Reads whole multipart messages.
pub struct MultipartReader<'a> {
    inner: RecordReader<'a>,
}

impl<'a> MultipartReader<'a> {
    pub(crate) fn new(inner: RecordReader<'a>) -> Self {
        Self { inner }
    }

    /// Next message. A malformed record is consumed and reported.
    pub fn read_message(&mut self) -> ShmResult<Vec<Frame>> {
        let record = self.inner.peek().ok_or(ShmError::Empty)?;
        let parsed = parse_frames(record).map(|f| f.into_iter().map(Frame::from).collect());
        self.inner.shift()?;
        parsed
    }

    /// No message is available.
    pub fn is_empty(&mut self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::super::{RingBuffer, RingConfig};
    use super::*;

    #[test]
    fn frames_round_trip_with_flags() {
        let ring = RingBuffer::create_local("m", &RingConfig::multipart(1024)).unwrap();
        let mut w = ring.multipart_writer().unwrap();
        let mut r = ring.multipart_reader().unwrap();
        w.add_frame(b"hdr", 1, 7).add_frame(b"body!", 2, 8);
        assert_eq!(w.pending_frames(), 2);
        w.commit().unwrap();
        let msg = r.read_message().unwrap();
        assert_eq!(msg.len(), 2);
        assert_eq!(msg[0].flags, FrameFlags::MORE);
        assert_eq!(msg[0].data, b"hdr");
        assert_eq!((msg[1].msgid, msg[1].format), (2, 8));
        assert_eq!(msg[1].flags, FrameFlags::EOR);
        assert!(matches!(r.read_message(), Err(ShmError::Empty)));
    }

    #[test]
    fn commit_keeps_frames_when_full() {
        let ring = RingBuffer::create_local("m", &RingConfig::multipart(128)).unwrap();
        let mut w = ring.multipart_writer().unwrap();
        let mut r = ring.multipart_reader().unwrap();
        w.add_frame(&[1u8; 32], 0, 0).commit().unwrap();
        w.add_frame(&[2u8; 32], 0, 0).commit().unwrap();
        w.add_frame(&[3u8; 32], 0, 0);
        assert!(matches!(w.commit(), Err(ShmError::WouldBlock)));
        assert_eq!(w.pending_frames(), 1);
        r.read_message().unwrap();
        w.commit().unwrap();
        assert_eq!(r.read_message().unwrap()[0].data, vec![2u8; 32]);
        assert_eq!(r.read_message().unwrap()[0].data, vec![3u8; 32]);
        assert!(w.commit().is_err());
    }

    #[test]
    fn missing_end_of_record_is_rejected() {
        let mut raw = Vec::new();
        FrameHeader {
            size: 1,
            msgid: 0,
            format: 0,
            flags: FrameFlags::MORE.bits(),
            _pad: 0,
        }
        .encode(&mut raw);
        raw.extend_from_slice(&[9, 0, 0, 0, 0, 0, 0, 0]);
        assert!(parse_frames(&raw).is_err());
        assert!(parse_frames(&raw[..10]).is_err());
    }
}

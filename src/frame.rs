use std::time::Duration;

use crate::error::{Result, TapError};
use crate::parser::LinkType;

pub const HEADER_MAGIC: u32 = 0x5254_4150;
pub const HEADER_VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 32;

/// A captured link-layer frame plus its receipt context.
///
/// The buffer is allocated once, with the capture snap length as capacity,
/// and refilled in place every time the owning work item is reused.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    wire_len: u32,
    timestamp: Duration,
    link: LinkType,
}

impl Frame {
    pub fn with_capacity(capacity: usize) -> Self {
        Frame {
            data: Vec::with_capacity(capacity),
            wire_len: 0,
            timestamp: Duration::ZERO,
            link: LinkType::Radiotap,
        }
    }

    /// Copies `bytes` into the preallocated buffer. Anything beyond the
    /// buffer's capacity is cut off so the capture path never allocates; the
    /// frame then reports itself as truncated.
    pub fn fill(&mut self, bytes: &[u8], wire_len: u32, timestamp: Duration, link: LinkType) {
        let n = bytes.len().min(self.data.capacity());
        self.data.clear();
        self.data.extend_from_slice(&bytes[..n]);
        self.wire_len = wire_len.max(bytes.len() as u32);
        self.timestamp = timestamp;
        self.link = link;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of the frame on the wire, which may exceed what was captured.
    pub fn wire_len(&self) -> u32 {
        self.wire_len
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn link(&self) -> LinkType {
        self.link
    }

    pub fn is_truncated(&self) -> bool {
        (self.data.len() as u32) < self.wire_len
    }
}

/// Fixed 32-byte preamble stamped onto every frame before classification.
///
/// Wire layout, all multi-byte fields big-endian:
/// magic(4) version(1) header length(1) hwaddr(6) packet id(4)
/// length(4) cumulative bytes(4) seconds(4) nanoseconds(4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataHeader {
    pub hwaddr: [u8; 6],
    pub packet_id: u32,
    /// Captured frame bytes following the header.
    pub length: u32,
    /// Cumulative captured bytes on the device, this frame included.
    pub bytes: u32,
    pub seconds: u32,
    pub nanoseconds: u32,
}

impl MetadataHeader {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&HEADER_MAGIC.to_be_bytes());
        buf.push(HEADER_VERSION);
        buf.push(HEADER_LEN as u8);
        buf.extend_from_slice(&self.hwaddr);
        buf.extend_from_slice(&self.packet_id.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.bytes.to_be_bytes());
        buf.extend_from_slice(&self.seconds.to_be_bytes());
        buf.extend_from_slice(&self.nanoseconds.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(TapError::invalid(format!(
                "metadata header needs {} bytes, got {}",
                HEADER_LEN,
                buf.len()
            )));
        }
        let word = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

        let magic = word(0);
        if magic != HEADER_MAGIC {
            return Err(TapError::invalid(format!("bad header magic 0x{:08x}", magic)));
        }
        if buf[4] != HEADER_VERSION {
            return Err(TapError::invalid(format!("unsupported header version {}", buf[4])));
        }
        if buf[5] as usize != HEADER_LEN {
            return Err(TapError::invalid(format!("bad header length {}", buf[5])));
        }

        let mut hwaddr = [0u8; 6];
        hwaddr.copy_from_slice(&buf[6..12]);
        Ok(MetadataHeader {
            hwaddr,
            packet_id: word(12),
            length: word(16),
            bytes: word(20),
            seconds: word(24),
            nanoseconds: word(28),
        })
    }
}

/// A frame copied behind its metadata header. This is what the chain engine
/// classifies and what `forward` rules put on the wire.
#[derive(Debug)]
pub struct TaggedFrame {
    header: MetadataHeader,
    buf: Vec<u8>,
    link: LinkType,
}

impl TaggedFrame {
    pub fn stamp(
        hwaddr: [u8; 6],
        packet_id: u32,
        cumulative_bytes: u64,
        frame: &Frame,
    ) -> Result<Self> {
        let ts = frame.timestamp();
        let header = MetadataHeader {
            hwaddr,
            packet_id,
            length: frame.len() as u32,
            bytes: cumulative_bytes as u32,
            seconds: ts.as_secs() as u32,
            nanoseconds: ts.subsec_nanos(),
        };

        let mut buf = Vec::new();
        buf.try_reserve_exact(HEADER_LEN + frame.len())
            .map_err(|e| TapError::AllocationFailure(format!("tagged frame copy: {}", e)))?;
        header.encode_into(&mut buf);
        buf.extend_from_slice(frame.data());

        Ok(TaggedFrame {
            header,
            buf,
            link: frame.link(),
        })
    }

    pub fn header(&self) -> &MetadataHeader {
        &self.header
    }

    /// Header and frame, as forwarded.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The captured frame alone.
    pub fn frame(&self) -> &[u8] {
        &self.buf[HEADER_LEN..]
    }

    pub fn link(&self) -> LinkType {
        self.link
    }
}

#[cfg(test)]
pub(crate) fn tagged(bytes: &[u8], link: LinkType) -> TaggedFrame {
    let mut frame = Frame::with_capacity(bytes.len());
    frame.fill(bytes, bytes.len() as u32, Duration::from_secs(1), link);
    TaggedFrame::stamp([0; 6], 1, bytes.len() as u64, &frame).unwrap()
}

//! Wire codec for tunnel frames.
//!
//! Everything on a tunnel connection, authentication included, is a frame:
//!
//! ```text
//! 0        1        2        3        4                8               12
//! +--------+--------+--------+--------+----------------+----------------+
//! | magic  | version|  type  |  rsvd  |   stream id    | payload length |
//! +--------+--------+--------+--------+----------------+----------------+
//! |                 payload (length bytes)             |  crc32 (4)     |
//! +----------------------------------------------------+----------------+
//! ```
//!
//! Integers are big-endian. The CRC covers header and payload. Stream id 0
//! addresses the session itself.

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

const MAGIC: u8 = 0xC7;
const VERSION: u8 = 1;
const HEADER_LEN: usize = 12;
const CRC_LEN: usize = 4;
pub const MAX_PAYLOAD_SIZE: usize = 65_535;
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Bad frame magic 0x{0:02X}")]
    InvalidMagic(u8),

    #[error("Unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown frame type {0}")]
    InvalidFrameType(u8),

    #[error("Frame payload of {0} bytes exceeds {max}", max = MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),

    #[error("Frame checksum mismatch (wire 0x{wire:08X}, computed 0x{computed:08X})")]
    ChecksumMismatch { wire: u32, computed: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Authentication exchange on stream 0
    Auth = 1,
    /// Open request; payload is the `host:port` target
    Syn = 2,
    /// Open outcome; empty payload on success, reason text otherwise
    SynResult = 3,
    Data = 4,
    /// Half-close of the sender's direction
    Fin = 5,
    /// Abort
    Rst = 6,
    Ping = 7,
    Pong = 8,
    /// Returns stream credits; payload is a u32 frame count
    WindowUpdate = 9,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        Ok(match value {
            1 => FrameType::Auth,
            2 => FrameType::Syn,
            3 => FrameType::SynResult,
            4 => FrameType::Data,
            5 => FrameType::Fin,
            6 => FrameType::Rst,
            7 => FrameType::Ping,
            8 => FrameType::Pong,
            9 => FrameType::WindowUpdate,
            other => return Err(FrameError::InvalidFrameType(other)),
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: FrameType, stream_id: u32, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Frame {
            frame_type,
            stream_id,
            payload,
        })
    }

    /// Frame without payload
    pub fn signal(frame_type: FrameType, stream_id: u32) -> Self {
        Frame {
            frame_type,
            stream_id,
            payload: Vec::new(),
        }
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        HEADER_LEN + self.payload.len() + CRC_LEN
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame({:?}, stream={}, {} bytes)",
            self.frame_type,
            self.stream_id,
            self.payload.len()
        )
    }
}

pub fn encode(frame: &Frame) -> Vec<u8> {
    let mut out = vec![0u8; frame.size()];
    out[0] = MAGIC;
    out[1] = VERSION;
    out[2] = frame.frame_type as u8;
    BigEndian::write_u32(&mut out[4..8], frame.stream_id);
    BigEndian::write_u32(&mut out[8..HEADER_LEN], frame.payload.len() as u32);

    let body_end = HEADER_LEN + frame.payload.len();
    out[HEADER_LEN..body_end].copy_from_slice(&frame.payload);
    let crc = checksum(&out[..body_end]);
    BigEndian::write_u32(&mut out[body_end..], crc);
    out
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

struct Header {
    frame_type: FrameType,
    stream_id: u32,
    payload_len: usize,
}

impl Header {
    fn parse(bytes: &[u8]) -> Result<Header, FrameError> {
        if bytes[0] != MAGIC {
            return Err(FrameError::InvalidMagic(bytes[0]));
        }
        if bytes[1] != VERSION {
            return Err(FrameError::UnsupportedVersion(bytes[1]));
        }
        let frame_type = FrameType::try_from(bytes[2])?;
        let payload_len = BigEndian::read_u32(&bytes[8..HEADER_LEN]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        Ok(Header {
            frame_type,
            stream_id: BigEndian::read_u32(&bytes[4..8]),
            payload_len,
        })
    }
}

/// Accumulates bytes and yields every complete frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data`; returns the frames it completed. Partial input stays
    /// buffered for the next call.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.pending.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= HEADER_LEN + CRC_LEN {
            let rest = &self.pending[offset..];
            let header = Header::parse(&rest[..HEADER_LEN])?;
            let body_end = HEADER_LEN + header.payload_len;
            if rest.len() < body_end + CRC_LEN {
                break;
            }

            let wire = BigEndian::read_u32(&rest[body_end..body_end + CRC_LEN]);
            let computed = checksum(&rest[..body_end]);
            if wire != computed {
                return Err(FrameError::ChecksumMismatch { wire, computed });
            }

            frames.push(Frame {
                frame_type: header.frame_type,
                stream_id: header.stream_id,
                payload: rest[HEADER_LEN..body_end].to_vec(),
            });
            offset += body_end + CRC_LEN;
        }
        self.pending.drain(..offset);

        trace!(frames = frames.len(), buffered = self.pending.len(), "Frames decoded");
        Ok(frames)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.pending.len()
    }
}

/// Pulls whole frames off an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    ready: VecDeque<Frame>,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        FrameReader {
            reader,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Returns the next frame, or `None` once the stream ends cleanly.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered_bytes() > 0 {
                    return Err(FrameError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a frame",
                    )));
                }
                return Ok(None);
            }
            self.ready.extend(self.decoder.decode(&self.chunk[..n])?);
        }
    }
}

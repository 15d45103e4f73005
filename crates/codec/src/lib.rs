//! ## Trellis wire codec
//!
//! Every message on a trellis session, whether it travels between two relays
//! or between a client and its relay, is carried as a 4-byte big-endian
//! length header followed by exactly that many bytes of record. The record
//! layout is fixed and identical on every component:
//!
//! ```text
//! opcode        u8
//! from          u64    sending client handle (0 if unused)
//! to            u64    destination client handle (0 if unused)
//! intermediate  i64    routing shift register (-1 = unset)
//! from_node     u64    relay id of the last forwarder
//! to_node       u64    relay id of the next hop
//! content       u32 length prefix + bytes
//! already_been  u32 count prefix + count * u64 relay ids
//! ```
//!
//! The reader side must accumulate bytes until a whole record is buffered;
//! a single read call is never assumed to deliver a complete frame.

use std::array::TryFromSliceError;

use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Size of the length header preceding every record.
pub const HEADER_SIZE: usize = 4;

/// Fixed portion of the record: opcode, the five id fields and the content
/// length prefix.
const RECORD_FIXED_SIZE: usize = 1 + 8 * 5 + 4;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    UnknownOpcode(u8),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// Message kind carried in the first record byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Opcode {
    PeerId = 0,
    RegisterClient = 1,
    RegisterClientResp = 2,
    Data = 3,
    ClientNonExistent = 4,
    Ping = 5,
    Pong = 6,
    GetClientCert = 7,
    GetClientCertResp = 8,
    ClientLocation = 9,
    AesKey = 10,
}

/// One framed message.
///
/// `from` and `to` are client handles, `from_node` and `to_node` are relay
/// ids. `intermediate` holds the remaining destination bits consumed by the
/// per-hop routing step; -1 means no relay has seeded it yet. `already_been`
/// is only populated by `ClientLocation` gossip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub from: u64,
    pub to: u64,
    pub intermediate: i64,
    pub from_node: u64,
    pub to_node: u64,
    pub content: Vec<u8>,
    pub already_been: Vec<u64>,
}

impl Frame {
    /// Create an empty frame of the given kind.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            from: 0,
            to: 0,
            intermediate: -1,
            from_node: 0,
            to_node: 0,
            content: Vec::new(),
            already_been: Vec::new(),
        }
    }

    /// Total size in bytes of the frame starting at `bytes`, including the
    /// length header itself.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use trellis_codec::{Frame, Opcode};
    ///
    /// let mut bytes = BytesMut::new();
    /// Frame::new(Opcode::Ping).encode(&mut bytes);
    ///
    /// assert_eq!(Frame::message_size(&bytes).unwrap(), bytes.len());
    /// ```
    pub fn message_size(bytes: &[u8]) -> Result<usize, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidInput);
        }

        let size = u32::from_be_bytes(bytes[..HEADER_SIZE].try_into()?) as usize;
        Ok(HEADER_SIZE + size)
    }

    /// Encode the frame into `bytes`, replacing any previous contents.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use trellis_codec::{Frame, Opcode};
    ///
    /// let mut frame = Frame::new(Opcode::Data);
    /// frame.from = 1;
    /// frame.to = 2;
    /// frame.content = b"hello".to_vec();
    ///
    /// let mut bytes = BytesMut::new();
    /// frame.encode(&mut bytes);
    ///
    /// assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        let size = RECORD_FIXED_SIZE + self.content.len() + 4 + 8 * self.already_been.len();

        bytes.clear();
        bytes.reserve(HEADER_SIZE + size);
        bytes.put_u32(size as u32);
        bytes.put_u8(self.opcode.into());
        bytes.put_u64(self.from);
        bytes.put_u64(self.to);
        bytes.put_i64(self.intermediate);
        bytes.put_u64(self.from_node);
        bytes.put_u64(self.to_node);
        bytes.put_u32(self.content.len() as u32);
        bytes.extend_from_slice(&self.content);
        bytes.put_u32(self.already_been.len() as u32);
        for id in &self.already_been {
            bytes.put_u64(*id);
        }
    }

    /// Encode into a freshly allocated frozen buffer.
    pub fn to_bytes(&self) -> bytes::Bytes {
        let mut bytes = BytesMut::new();
        self.encode(&mut bytes);
        bytes.freeze()
    }

    /// Decode a whole frame, header included.
    ///
    /// `bytes` must hold at least `message_size` bytes; trailing bytes beyond
    /// the framed length are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let size = Self::message_size(bytes)?;
        if bytes.len() < size {
            return Err(Error::InvalidInput);
        }

        let mut buf = &bytes[HEADER_SIZE..size];
        if buf.remaining() < RECORD_FIXED_SIZE {
            return Err(Error::InvalidInput);
        }

        let opcode = buf.get_u8();
        let opcode = Opcode::try_from(opcode).map_err(|_| Error::UnknownOpcode(opcode))?;
        let from = buf.get_u64();
        let to = buf.get_u64();
        let intermediate = buf.get_i64();
        let from_node = buf.get_u64();
        let to_node = buf.get_u64();

        let content_size = buf.get_u32() as usize;
        if buf.remaining() < content_size + 4 {
            return Err(Error::InvalidInput);
        }

        let content = buf[..content_size].to_vec();
        buf.advance(content_size);

        let count = buf.get_u32() as usize;
        if buf.remaining() < count.checked_mul(8).ok_or(Error::InvalidInput)? {
            return Err(Error::InvalidInput);
        }

        let mut already_been = Vec::with_capacity(count);
        for _ in 0..count {
            already_been.push(buf.get_u64());
        }

        Ok(Self {
            opcode,
            from,
            to,
            intermediate,
            from_node,
            to_node,
            content,
            already_been,
        })
    }
}

//! Message envelope wire format.
//!
//! Every request and reply is a fixed 60-byte little-endian header followed by
//! an opaque body:
//!
//! ```text
//! [magic:4][version:4][type:4][opc:4][status:4][xid:8][transno:8]
//! [last_xid:8][last_committed:8][body_len:4][checksum:4][body:N]
//! ```
//!
//! - **checksum**: CRC32C over the 56 header bytes before it, then the body
//! - **last_xid / last_committed**: meaningful in replies only; they carry the
//!   peer's view of the connection so no separate commit message exists

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::EINVAL;

/// Envelope magic.
pub const MAGIC: u32 = 0x0BD0_0BD0;

/// Envelope version.
pub const VERSION: u32 = 0x0004_0003;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 60;

/// Offset of the checksum field, which is the last header field.
const CHECKSUM_OFFSET: usize = HEADER_SIZE - 4;

/// Largest body accepted when unpacking.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the envelope.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Magic does not match.
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    /// Version does not match.
    #[error("bad version {0:#010x}")]
    BadVersion(u32),

    /// Unknown message type.
    #[error("unknown message type {0}")]
    UnknownType(u32),

    /// Declared body length disagrees with the buffer.
    #[error("body length {declared} does not match {actual} available bytes")]
    LengthMismatch {
        /// Length from the header.
        declared: usize,
        /// Bytes present after the header.
        actual: usize,
    },

    /// Body exceeds [`MAX_BODY_SIZE`].
    #[error("body too large: {size} bytes (max {MAX_BODY_SIZE})")]
    BodyTooLarge {
        /// Declared body size.
        size: usize,
    },

    /// Checksum verification failed.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum from the header.
        expected: u32,
        /// Checksum computed from the data.
        actual: u32,
    },
}

/// Message type carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    /// Client request.
    Request = 4711,
    /// Error reply: the peer could not process the request at all.
    Err = 4712,
    /// Normal reply.
    Reply = 4713,
}

impl TryFrom<u32> for MsgType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            4711 => Ok(Self::Request),
            4712 => Ok(Self::Err),
            4713 => Ok(Self::Reply),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// Envelope header fields other than magic, version, length and checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Message type.
    pub msg_type: MsgType,
    /// Operation code.
    pub opc: u32,
    /// Reply status, zero on success.
    pub status: i32,
    /// Sequence id matching a reply to its request.
    pub xid: u64,
    /// Transaction number, zero for non-mutating operations.
    pub transno: u64,
    /// Last xid the peer has seen on this connection.
    pub last_xid: u64,
    /// Highest transaction number the peer has committed.
    pub last_committed: u64,
}

impl MsgHeader {
    /// Header of an outgoing request.
    pub fn request(opc: u32, xid: u64, transno: u64) -> Self {
        Self {
            msg_type: MsgType::Request,
            opc,
            status: 0,
            xid,
            transno,
            last_xid: 0,
            last_committed: 0,
        }
    }

    /// Header of a reply to `request`.
    pub fn reply_to(request: &MsgHeader, status: i32) -> Self {
        Self {
            msg_type: MsgType::Reply,
            status,
            ..*request
        }
    }

    /// Set the transaction number.
    pub fn with_transno(mut self, transno: u64) -> Self {
        self.transno = transno;
        self
    }

    /// Set the peer's commit point and last seen xid.
    pub fn with_commit(mut self, last_xid: u64, last_committed: u64) -> Self {
        self.last_xid = last_xid;
        self.last_committed = last_committed;
        self
    }
}

/// A header plus its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Envelope header.
    pub header: MsgHeader,
    /// Opaque body.
    pub body: Bytes,
}

impl Message {
    /// Create a message.
    pub fn new(header: MsgHeader, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    /// Serialize to wire bytes.
    ///
    /// Callers keep bodies within [`MAX_BODY_SIZE`]; the peer refuses
    /// anything larger.
    pub fn pack(&self) -> Bytes {
        debug_assert!(self.body.len() <= MAX_BODY_SIZE, "body exceeds MAX_BODY_SIZE");
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        let h = &self.header;
        buf.put_u32_le(MAGIC);
        buf.put_u32_le(VERSION);
        buf.put_u32_le(h.msg_type as u32);
        buf.put_u32_le(h.opc);
        buf.put_i32_le(h.status);
        buf.put_u64_le(h.xid);
        buf.put_u64_le(h.transno);
        buf.put_u64_le(h.last_xid);
        buf.put_u64_le(h.last_committed);
        buf.put_u32_le(self.body.len() as u32);

        let checksum = compute_checksum(&buf[..CHECKSUM_OFFSET], &self.body);
        buf.put_u32_le(checksum);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Parse and verify wire bytes.
    ///
    /// # Errors
    ///
    /// Rejects short buffers, bad magic or version, unknown types, body length
    /// disagreements and checksum mismatches.
    pub fn unpack(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: data.len(),
            });
        }

        let mut cur = &data[..HEADER_SIZE];
        let magic = cur.get_u32_le();
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let version = cur.get_u32_le();
        if version != VERSION {
            return Err(WireError::BadVersion(version));
        }
        let msg_type = MsgType::try_from(cur.get_u32_le())?;
        let opc = cur.get_u32_le();
        let status = cur.get_i32_le();
        let xid = cur.get_u64_le();
        let transno = cur.get_u64_le();
        let last_xid = cur.get_u64_le();
        let last_committed = cur.get_u64_le();
        let body_len = cur.get_u32_le() as usize;
        let checksum = cur.get_u32_le();

        if body_len > MAX_BODY_SIZE {
            return Err(WireError::BodyTooLarge { size: body_len });
        }
        let body = &data[HEADER_SIZE..];
        if body.len() != body_len {
            return Err(WireError::LengthMismatch {
                declared: body_len,
                actual: body.len(),
            });
        }

        let computed = compute_checksum(&data[..CHECKSUM_OFFSET], body);
        if computed != checksum {
            return Err(WireError::ChecksumMismatch {
                expected: checksum,
                actual: computed,
            });
        }

        Ok(Self {
            header: MsgHeader {
                msg_type,
                opc,
                status,
                xid,
                transno,
                last_xid,
                last_committed,
            },
            body: Bytes::copy_from_slice(body),
        })
    }

    /// Map the reply status to an error code.
    ///
    /// An error reply always fails, with `-EINVAL` when it carries no status.
    pub fn check_status(&self) -> Result<(), i32> {
        let status = self.header.status;
        if self.header.msg_type == MsgType::Err {
            return Err(if status != 0 { status } else { -EINVAL });
        }
        if status != 0 {
            return Err(status);
        }
        Ok(())
    }
}

fn compute_checksum(header: &[u8], body: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(header), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(
            MsgHeader::request(101, 7, 0).with_commit(3, 2),
            Bytes::from_static(b"getattr"),
        )
    }

    #[test]
    fn test_layout() {
        let packed = sample().pack();
        assert_eq!(packed.len(), HEADER_SIZE + 7);
        assert_eq!(&packed[0..4], &MAGIC.to_le_bytes());
        assert_eq!(&packed[4..8], &VERSION.to_le_bytes());
        assert_eq!(&packed[8..12], &4711u32.to_le_bytes());
        assert_eq!(&packed[12..16], &101u32.to_le_bytes());
        assert_eq!(&packed[20..28], &7u64.to_le_bytes());
        assert_eq!(&packed[52..56], &7u32.to_le_bytes());
        assert_eq!(&packed[HEADER_SIZE..], b"getattr");
    }

    #[test]
    fn test_unpack_preserves_fields() {
        let msg = sample();
        let parsed = Message::unpack(&msg.pack()).expect("unpack");
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_unpack_short_buffer() {
        assert_eq!(
            Message::unpack(&[0u8; 10]),
            Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: 10
            })
        );
    }

    #[test]
    fn test_unpack_bad_magic_and_version() {
        let mut data = sample().pack().to_vec();
        data[0] ^= 0xff;
        assert!(matches!(Message::unpack(&data), Err(WireError::BadMagic(_))));

        let mut data = sample().pack().to_vec();
        data[4] ^= 0xff;
        assert!(matches!(
            Message::unpack(&data),
            Err(WireError::BadVersion(_))
        ));
    }

    #[test]
    fn test_unpack_unknown_type() {
        let mut data = sample().pack().to_vec();
        data[8..12].copy_from_slice(&9999u32.to_le_bytes());
        assert_eq!(Message::unpack(&data), Err(WireError::UnknownType(9999)));
    }

    #[test]
    fn test_unpack_truncated_body() {
        let data = sample().pack();
        assert_eq!(
            Message::unpack(&data[..data.len() - 2]),
            Err(WireError::LengthMismatch {
                declared: 7,
                actual: 5
            })
        );
    }

    #[test]
    fn test_unpack_detects_corruption() {
        let mut data = sample().pack().to_vec();
        let last = data.len() - 1;
        data[last] ^= 0x01;
        assert!(matches!(
            Message::unpack(&data),
            Err(WireError::ChecksumMismatch { .. })
        ));

        // Header fields are covered too.
        let mut data = sample().pack().to_vec();
        data[36] ^= 0x01;
        assert!(matches!(
            Message::unpack(&data),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_check_status() {
        let request = sample().header;
        let ok = Message::new(MsgHeader::reply_to(&request, 0), Bytes::new());
        assert_eq!(ok.check_status(), Ok(()));

        let failed = Message::new(MsgHeader::reply_to(&request, -2), Bytes::new());
        assert_eq!(failed.check_status(), Err(-2));

        let mut err = MsgHeader::reply_to(&request, 0);
        err.msg_type = MsgType::Err;
        assert_eq!(
            Message::new(err, Bytes::new()).check_status(),
            Err(-EINVAL)
        );
        err.status = -5;
        assert_eq!(Message::new(err, Bytes::new()).check_status(), Err(-5));
    }
}

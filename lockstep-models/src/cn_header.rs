// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The congestion-notification header.
//!
//! An 8-byte record carried between transport endpoints. On the wire it is,
//! with multi-byte fields in network (big-endian) byte order:
//!
//! | Offset | Size | Field                      |
//! |--------|------|----------------------------|
//! | 0      | 1    | queue index                |
//! | 1      | 2    | flow id                    |
//! | 3      | 1    | ECN bits                   |
//! | 4      | 2    | queue feedback (`qfb`)     |
//! | 6      | 2    | total                      |
//!
//! The last four bytes have a second view: a 32-bit sequence number. The two
//! views share the same storage. Setting the sequence number overwrites
//! `qfb`/`total` with the halves of that number and vice versa, so an
//! instance must only ever be read through the view it was written with.
//!
//! ```rust
//! use lockstep_models::cn_header::CongestionHeader;
//!
//! let header = CongestionHeader::new(0x0102, 3, 0x40, 7, 9);
//! assert_eq!(header.to_bytes(), [3, 0x01, 0x02, 0x40, 0, 7, 0, 9]);
//!
//! let mut header = CongestionHeader::default();
//! header.set_seq(0x0007_0009);
//! assert_eq!((header.qfb(), header.total()), (7, 9));
//! ```

use std::fmt;

use bytes::{Buf, BufMut};

use crate::CodecError;

/// Header fields in wire order. The trailing four bytes are shared by the
/// feedback/total pair and the sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CongestionHeader {
    q_index: u8,
    fid: u16,
    ecn_bits: u8,
    tail: u32,
}

impl CongestionHeader {
    /// Number of bytes of an encoded header.
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn new(fid: u16, q_index: u8, ecn_bits: u8, qfb: u16, total: u16) -> Self {
        let mut header = Self {
            q_index,
            fid,
            ecn_bits,
            tail: 0,
        };
        header.set_qfb(qfb);
        header.set_total(total);
        header
    }

    #[must_use]
    pub fn flow(&self) -> u16 {
        self.fid
    }

    pub fn set_flow(&mut self, fid: u16) {
        self.fid = fid;
    }

    #[must_use]
    pub fn q_index(&self) -> u8 {
        self.q_index
    }

    pub fn set_q_index(&mut self, q_index: u8) {
        self.q_index = q_index;
    }

    #[must_use]
    pub fn ecn_bits(&self) -> u8 {
        self.ecn_bits
    }

    pub fn set_ecn_bits(&mut self, ecn_bits: u8) {
        self.ecn_bits = ecn_bits;
    }

    /// Queue feedback: the upper half of the shared trailing word.
    #[must_use]
    pub fn qfb(&self) -> u16 {
        (self.tail >> 16) as u16
    }

    pub fn set_qfb(&mut self, qfb: u16) {
        self.tail = (self.tail & 0x0000_ffff) | (u32::from(qfb) << 16);
    }

    /// Total: the lower half of the shared trailing word.
    #[must_use]
    pub fn total(&self) -> u16 {
        (self.tail & 0x0000_ffff) as u16
    }

    pub fn set_total(&mut self, total: u16) {
        self.tail = (self.tail & 0xffff_0000) | u32::from(total);
    }

    /// Sequence number: the whole shared trailing word.
    #[must_use]
    pub fn seq(&self) -> u32 {
        self.tail
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.tail = seq;
    }

    /// Append the encoded header to `buf`.
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.q_index);
        buf.put_u16(self.fid);
        buf.put_u8(self.ecn_bits);
        buf.put_u32(self.tail);
    }

    /// Decode a header from the front of `buf`.
    pub fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < Self::SIZE {
            return Err(CodecError::ShortBuffer {
                needed: Self::SIZE,
                available: buf.remaining(),
            });
        }
        let q_index = buf.get_u8();
        let fid = buf.get_u16();
        let ecn_bits = buf.get_u8();
        let tail = buf.get_u32();
        Ok(Self {
            q_index,
            fid,
            ecn_bits,
            tail,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        self.write(&mut &mut bytes[..]);
        bytes
    }

    /// Decode exactly one header from `bytes`.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, CodecError> {
        let header = Self::read(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(CodecError::TrailingBytes(bytes.len()));
        }
        Ok(header)
    }
}

// The fields must exactly fill the encoded size.
const _: () = assert!(
    size_of::<u8>() + size_of::<u16>() + size_of::<u8>() + size_of::<u32>()
        == CongestionHeader::SIZE
);

impl fmt::Display for CongestionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " qFb={}/{}", self.qfb(), self.total())
    }
}

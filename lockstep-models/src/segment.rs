// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

//! The frame used to carry a segment to the worker that owns its
//! destination.
//!
//! A frame starts with a [`CongestionHeader`] used in its sequence view (flow
//! id, priority as queue index and the segment number) followed by the
//! routing fields. All multi-byte fields are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::CodecError;
use crate::cn_header::CongestionHeader;
use crate::endpoint::SegmentContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentFrame {
    pub header: CongestionHeader,
    pub src_node: u32,
    pub dst_node: u32,
    pub dst_port: u16,
    pub payload_len: u32,
    /// Arrival time at the destination as computed by the sender, in whole
    /// nanoseconds.
    pub arrival_ns: u64,
}

impl SegmentFrame {
    pub const SIZE: usize = CongestionHeader::SIZE + 4 + 4 + 2 + 4 + 8;

    #[must_use]
    pub fn from_context(ctx: &SegmentContext) -> Self {
        let mut header = CongestionHeader::default();
        header.set_flow(ctx.flow_id);
        header.set_q_index(ctx.priority);
        header.set_seq(ctx.seq);
        Self {
            header,
            src_node: ctx.src_node,
            dst_node: ctx.dst_node,
            dst_port: ctx.dst_port,
            payload_len: ctx.payload_len,
            arrival_ns: ctx.arrival_ns.ceil() as u64,
        }
    }

    #[must_use]
    pub fn to_context(&self) -> SegmentContext {
        SegmentContext {
            flow_id: self.header.flow(),
            src_node: self.src_node,
            dst_node: self.dst_node,
            dst_port: self.dst_port,
            seq: self.header.seq(),
            payload_len: self.payload_len,
            priority: self.header.q_index(),
            arrival_ns: self.arrival_ns as f64,
        }
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        self.header.write(buf);
        buf.put_u32(self.src_node);
        buf.put_u32(self.dst_node);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.payload_len);
        buf.put_u64(self.arrival_ns);
    }

    pub fn read(buf: &mut impl Buf) -> Result<Self, CodecError> {
        if buf.remaining() < Self::SIZE {
            return Err(CodecError::ShortBuffer {
                needed: Self::SIZE,
                available: buf.remaining(),
            });
        }
        let header = CongestionHeader::read(buf)?;
        Ok(Self {
            header,
            src_node: buf.get_u32(),
            dst_node: buf.get_u32(),
            dst_port: buf.get_u16(),
            payload_len: buf.get_u32(),
            arrival_ns: buf.get_u64(),
        })
    }

    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.write(&mut buf);
        buf.freeze()
    }

    /// Decode a frame that must fill `bytes` exactly.
    pub fn decode(mut bytes: Bytes) -> Result<Self, CodecError> {
        let frame = Self::read(&mut bytes)?;
        if bytes.has_remaining() {
            return Err(CodecError::TrailingBytes(bytes.remaining()));
        }
        Ok(frame)
    }
}

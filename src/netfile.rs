//! Net-file stub (C9): a thin client over a length-prefixed request/
//! response protocol to a remote process running its own copy of the
//! core. Grounded on spec.md §4.9's "net-file stub" line; the wire format
//! here is deliberately minimal (4-byte big-endian length, opcode byte,
//! payload) since the spec names the shape of the protocol but not its
//! byte layout.

use crate::error::{Result, StoreError};
use num_enum::TryFromPrimitive;
use std::io::{Read, Write};
use std::net::TcpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum NetOp {
    Read = 1,
    Write = 2,
    Delete = 3,
}

/// Decodes the opcode byte of a frame built by `encode_frame`, for the
/// server side of the protocol that has to dispatch on an untrusted byte
/// rather than a value it chose itself.
pub fn decode_op(byte: u8) -> Result<NetOp> {
    NetOp::try_from_primitive(byte).map_err(|_| StoreError::Corrupt(format!("unknown net-file opcode {}", byte)))
}

pub struct NetFile {
    stream: TcpStream,
}

fn encode_frame(op: NetOp, id: &[u8], data: &[u8]) -> Vec<u8> {
    let body_len = 1 + 2 + id.len() + data.len();
    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.push(op as u8);
    buf.extend_from_slice(&(id.len() as u16).to_be_bytes());
    buf.extend_from_slice(id);
    buf.extend_from_slice(data);
    buf
}

impl NetFile {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(StoreError::Io)?;
        Ok(Self { stream })
    }

    fn roundtrip(&mut self, op: NetOp, id: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let frame = encode_frame(op, id, data);
        self.stream.write_all(&frame).map_err(StoreError::Io)?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).map_err(StoreError::Io)?;
        let len = u32::from_be_bytes(len_buf) as usize;

        let mut status_buf = [0u8; 1];
        self.stream.read_exact(&mut status_buf).map_err(StoreError::Io)?;

        let mut body = vec![0u8; len.saturating_sub(1)];
        self.stream.read_exact(&mut body).map_err(StoreError::Io)?;

        if status_buf[0] != 0 {
            return Err(StoreError::NotFound);
        }
        Ok(body)
    }

    pub fn read(&mut self, id: &[u8]) -> Result<Vec<u8>> {
        self.roundtrip(NetOp::Read, id, &[])
    }

    pub fn write(&mut self, id: &[u8], data: &[u8]) -> Result<()> {
        self.roundtrip(NetOp::Write, id, data).map(|_| ())
    }

    pub fn delete(&mut self, id: &[u8]) -> Result<()> {
        self.roundtrip(NetOp::Delete, id, &[]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_carries_op_and_id_length() {
        let frame = encode_frame(NetOp::Write, b"K01", b"hi");
        let body_len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(body_len, frame.len() - 4);
        assert_eq!(frame[4], NetOp::Write as u8);
        let id_len = u16::from_be_bytes(frame[5..7].try_into().unwrap()) as usize;
        assert_eq!(id_len, 3);
        assert_eq!(&frame[7..7 + id_len], b"K01");
    }

    #[test]
    fn decode_op_rejects_unknown_byte() {
        assert_eq!(decode_op(2).unwrap(), NetOp::Write);
        assert!(decode_op(99).is_err());
    }
}

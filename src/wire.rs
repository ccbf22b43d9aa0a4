//! Wire formats: the connection private payload, the application payload
//! buffer layout, and the frames of the emulated fabric.
//!
//! The 12-byte private-payload descriptor is an external interface and is
//! hand-encoded big-endian so both peers agree on canonical byte order
//! regardless of host endianness. Fabric frames are internal to the
//! emulation and use bincode behind a length prefix.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RdmaError, Result};

/// Maximum connection private payload, by convention.
pub const MAX_PRIVATE_DATA: usize = 196;

/// Size of the encoded remote buffer descriptor.
pub const DESCRIPTOR_WIRE_LEN: usize = 12;

/// Inbound fabric frames larger than this are rejected outright.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// The capability a peer needs to target a one-sided write at a remote
/// memory region: its virtual address and remote access key.
///
/// Exchanged once, inside the accept event's private payload, and immutable
/// afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteBufferDescriptor {
    pub addr: u64,
    pub rkey: u32,
}

impl RemoteBufferDescriptor {
    /// Canonical wire encoding: 8-byte big-endian address followed by the
    /// 4-byte big-endian remote key.
    pub fn to_wire(&self) -> [u8; DESCRIPTOR_WIRE_LEN] {
        let mut out = [0u8; DESCRIPTOR_WIRE_LEN];
        out[..8].copy_from_slice(&self.addr.to_be_bytes());
        out[8..].copy_from_slice(&self.rkey.to_be_bytes());
        out
    }

    /// Restores host order from the canonical wire encoding.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DESCRIPTOR_WIRE_LEN {
            return Err(RdmaError::HandshakeProtocolViolation(format!(
                "private payload holds {} bytes, descriptor needs {}",
                bytes.len(),
                DESCRIPTOR_WIRE_LEN
            )));
        }
        let addr = u64::from_be_bytes(bytes[..8].try_into().expect("length checked"));
        let rkey = u32::from_be_bytes(bytes[8..12].try_into().expect("length checked"));
        Ok(Self { addr, rkey })
    }
}

/// Validates a connection private payload against the fixed maximum.
pub fn check_private_data_len(len: usize) -> Result<()> {
    if len > MAX_PRIVATE_DATA {
        return Err(RdmaError::PayloadTooLarge {
            len,
            max: MAX_PRIVATE_DATA,
        });
    }
    Ok(())
}

/// Packs u32 payload elements into the registered-buffer layout: element 0
/// is the big-endian element count, elements 1.. are the payload.
pub fn pack_payload(elements: &[u32], capacity_bytes: usize) -> Result<Vec<u8>> {
    let total_bytes = (elements.len() + 1) * 4;
    if total_bytes > capacity_bytes {
        return Err(RdmaError::ResourceExhaustion(format!(
            "payload of {} elements needs {} bytes, buffer holds {}",
            elements.len(),
            total_bytes,
            capacity_bytes
        )));
    }
    let mut out = Vec::with_capacity(total_bytes);
    out.extend_from_slice(&(elements.len() as u32).to_be_bytes());
    for element in elements {
        out.extend_from_slice(&element.to_be_bytes());
    }
    Ok(out)
}

/// Reads the payload elements back out of a buffer laid out by
/// [`pack_payload`].
pub fn unpack_payload(buf: &[u8]) -> Result<Vec<u32>> {
    if buf.len() < 4 {
        return Err(RdmaError::HandshakeProtocolViolation(
            "payload buffer shorter than its length prefix".into(),
        ));
    }
    let count = u32::from_be_bytes(buf[..4].try_into().expect("length checked")) as usize;
    let needed = (count + 1) * 4;
    if buf.len() < needed {
        return Err(RdmaError::HandshakeProtocolViolation(format!(
            "payload claims {count} elements but buffer holds {} bytes",
            buf.len()
        )));
    }
    let mut elements = Vec::with_capacity(count);
    for i in 0..count {
        let start = (i + 1) * 4;
        elements.push(u32::from_be_bytes(
            buf[start..start + 4].try_into().expect("length checked"),
        ));
    }
    Ok(elements)
}

/// Frames exchanged over the emulated fabric link.
///
/// `Write` carries a one-sided write: the receiving fabric applies it to the
/// registered region and produces no completion. `Send` must find a posted
/// receive on the passive side.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Frame {
    ConnectRequest { private_data: Vec<u8> },
    Accept { private_data: Vec<u8> },
    Reject,
    Ready,
    Write { raddr: u64, rkey: u32, data: Vec<u8> },
    Send { data: Vec<u8> },
    Disconnect,
}

/// Writes one length-prefixed frame.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    let body = bincode::serialize(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame. Returns `None` on clean EOF.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte cap"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let frame = bincode::deserialize(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_wire_bytes_are_big_endian() {
        let desc = RemoteBufferDescriptor {
            addr: 0x0102_0304_0506_0708,
            rkey: 0xAABB_CCDD,
        };
        let wire = desc.to_wire();
        assert_eq!(
            wire,
            [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xAA, 0xBB, 0xCC, 0xDD]
        );
        assert_eq!(RemoteBufferDescriptor::from_wire(&wire).unwrap(), desc);
    }

    #[test]
    fn short_descriptor_is_a_protocol_violation() {
        let err = RemoteBufferDescriptor::from_wire(&[0u8; 11]).unwrap_err();
        assert!(matches!(err, RdmaError::HandshakeProtocolViolation(_)));
    }

    #[test]
    fn private_data_boundary() {
        assert!(check_private_data_len(MAX_PRIVATE_DATA).is_ok());
        let err = check_private_data_len(MAX_PRIVATE_DATA + 1).unwrap_err();
        match err {
            RdmaError::PayloadTooLarge { len, max } => {
                assert_eq!(len, 197);
                assert_eq!(max, 196);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn payload_layout_round_trip() {
        let elements = vec![7, 42, 0xDEAD_BEEF];
        let buf = pack_payload(&elements, 64).unwrap();
        assert_eq!(&buf[..4], &3u32.to_be_bytes());
        assert_eq!(unpack_payload(&buf).unwrap(), elements);
    }

    #[test]
    fn payload_over_capacity_is_rejected() {
        let elements = vec![0u32; 16];
        // 17 slots needed, only 16 available.
        assert!(pack_payload(&elements, 64).is_err());
        assert!(pack_payload(&elements, 68).is_ok());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let buf = pack_payload(&[1, 2, 3], 64).unwrap();
        assert!(matches!(
            unpack_payload(&buf[..8]).unwrap_err(),
            RdmaError::HandshakeProtocolViolation(_)
        ));
    }

    #[tokio::test]
    async fn frame_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = Frame::Write {
            raddr: 0x4000_0000,
            rkey: 0x1001,
            data: vec![1, 2, 3, 4],
        };
        write_frame(&mut a, &frame).await.unwrap();
        write_frame(&mut a, &Frame::Disconnect).await.unwrap();
        drop(a);

        match read_frame(&mut b).await.unwrap() {
            Some(Frame::Write { raddr, rkey, data }) => {
                assert_eq!(raddr, 0x4000_0000);
                assert_eq!(rkey, 0x1001);
                assert_eq!(data, vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(matches!(
            read_frame(&mut b).await.unwrap(),
            Some(Frame::Disconnect)
        ));
        // Clean EOF.
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }
}

use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::util::buf::put_byte_slice;

/// One-byte discriminator at the start of every wire frame. Ping and pong frames consist of the
///  type byte alone; a message frame is followed by a packet body.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Ping = 0x00,
    Pong = 0x01,
    Message = 0x10,
}

/// marks the last fragment of a message
pub const EOF_YES: u8 = 0x01;
pub const EOF_NO: u8 = 0x00;

/// A single fragment of a message on some channel. Messages bigger than the configured packet
///  size are chopped into several packets for multiplexing; the EOF marker flags the fragment
///  that completes a message.
#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub channel_id: u8,
    pub eof: u8,
    pub bytes: Bytes,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet{{{:02X}:eof={}:{}B}}", self.channel_id, self.eof, self.bytes.len())
    }
}

impl Packet {
    /// Serializes the packet body (everything after the frame's type byte): channel id, EOF
    ///  marker, and the length-prefixed payload.
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.channel_id);
        buf.put_u8(self.eof);
        put_byte_slice(buf, &self.bytes);
    }
}

/// Reads one message packet body from the stream, returning it together with the number of bytes
///  consumed (the caller feeds that into its rate monitor).
///
/// Truncated frames surface as I/O errors; a malformed EOF marker or a payload length above
///  `max_packet_size` is a protocol violation and fatal to the connection.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R, max_packet_size: usize) -> anyhow::Result<(Packet, usize)> {
    let mut n = 0usize;

    let channel_id = reader.read_u8().await?;
    let eof = reader.read_u8().await?;
    n += 2;

    if eof != EOF_NO && eof != EOF_YES {
        return Err(anyhow!("invalid EOF marker {:#04x}", eof));
    }

    let len = read_usize_varint(reader, &mut n).await?;
    if len > max_packet_size {
        return Err(anyhow!("packet payload of {} bytes exceeds the limit of {}", len, max_packet_size));
    }

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes).await?;
    n += len;

    Ok((Packet { channel_id, eof, bytes: bytes.into() }, n))
}

/// Reads an unsigned LEB128 varint byte by byte, the streaming counterpart of the buffer-based
///  encoding in [crate::util::buf].
async fn read_usize_varint<R: AsyncRead + Unpin>(reader: &mut R, n: &mut usize) -> anyhow::Result<usize> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8().await?;
        *n += 1;

        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value as usize);
        }

        shift += 7;
        if shift >= 64 {
            return Err(anyhow!("varint exceeds 64 bits"));
        }
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::ping(0x00, Some(PacketType::Ping))]
    #[case::pong(0x01, Some(PacketType::Pong))]
    #[case::message(0x10, Some(PacketType::Message))]
    #[case::unknown(0x02, None)]
    #[case::unknown_high(0xFF, None)]
    fn test_packet_type_from_raw(#[case] raw: u8, #[case] expected: Option<PacketType>) {
        match PacketType::try_from(raw) {
            Ok(actual) => assert_eq!(Some(actual), expected),
            Err(_) => assert!(expected.is_none()),
        }
    }

    #[rstest]
    #[case::empty(0x01, EOF_YES, b"", b"\x01\x01\0")]
    #[case::not_eof(0x07, EOF_NO, b"abc", b"\x07\0\x03abc")]
    #[case::high_channel(0xFF, EOF_YES, b"x", b"\xFF\x01\x01x")]
    fn test_packet_ser(#[case] channel_id: u8, #[case] eof: u8, #[case] bytes: &[u8], #[case] expected: &[u8]) {
        let packet = Packet { channel_id, eof, bytes: Bytes::copy_from_slice(bytes) };
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        assert_eq!(&buf, expected);
    }

    #[rstest]
    #[case::empty(0x00, EOF_YES, 0)]
    #[case::one_byte(0x01, EOF_NO, 1)]
    #[case::short(0x42, EOF_YES, 100)]
    #[case::two_byte_varint(0x42, EOF_NO, 300)]
    #[case::max_size(0xFF, EOF_YES, 1024)]
    #[tokio::test]
    async fn test_packet_round_trip(#[case] channel_id: u8, #[case] eof: u8, #[case] len: usize) {
        let packet = Packet {
            channel_id,
            eof,
            bytes: (0..len).map(|i| i as u8).collect::<Vec<_>>().into(),
        };

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);

        let mut raw = &buf[..];
        let (actual, n) = read_packet(&mut raw, 1024).await.unwrap();
        assert_eq!(actual, packet);
        assert_eq!(n, buf.len());
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn test_read_packet_invalid_eof() {
        let mut raw: &[u8] = b"\x01\x02\x03abc";
        assert!(read_packet(&mut raw, 1024).await.is_err());
    }

    #[tokio::test]
    async fn test_read_packet_oversized() {
        let mut buf = BytesMut::new();
        let packet = Packet { channel_id: 1, eof: EOF_YES, bytes: vec![0u8; 2000].into() };
        packet.ser(&mut buf);

        let mut raw = &buf[..];
        assert!(read_packet(&mut raw, 1024).await.is_err());
    }

    #[tokio::test]
    async fn test_read_packet_truncated() {
        // announces five payload bytes but carries three
        let mut raw: &[u8] = b"\x01\x01\x05abc";
        assert!(read_packet(&mut raw, 1024).await.is_err());
    }
}

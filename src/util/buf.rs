use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;


/// Writes a length-prefixed byte slice: the byte count as an unsigned varint, followed by the
///  raw bytes. Both peers of a connection must agree on this encoding.
pub fn put_byte_slice(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

pub fn try_get_byte_slice(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        return Err(anyhow!("byte slice of {} bytes announced with only {} bytes remaining", len, buf.remaining()));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Writes a type byte followed by an already-encoded message body. Decoding requires a dispatch
///  on the type byte, so there is no single inverse; [try_get_typed] splits off the type byte and
///  leaves the body to the caller.
pub fn put_typed(buf: &mut BytesMut, msg_type: u8, msg: &[u8]) {
    buf.put_u8(msg_type);
    buf.put_slice(msg);
}

pub fn try_get_typed(buf: &mut impl Buf) -> anyhow::Result<(u8, Bytes)> {
    let msg_type = buf.try_get_u8()?;
    let body = buf.copy_to_bytes(buf.remaining());
    Ok((msg_type, body))
}

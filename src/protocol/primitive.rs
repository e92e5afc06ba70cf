//! Primitive notations of the CQL native protocol.
//!
//! All integers are big-endian. Readers thread a `(value, rest)` pair through
//! the input slice; writers append to a growable `Vec<u8>` so an encoded frame
//! can never be truncated by an undersized buffer.

use std::net::IpAddr;

use zerocopy::FromBytes;
use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE, U16 as U16BE};

use crate::error::{Error, Result};

/// Read a 1-byte signed integer
pub fn read_int8(data: &[u8]) -> Result<(i8, &[u8])> {
    if data.is_empty() {
        return Err(Error::UnexpectedEof);
    }
    Ok((data[0] as i8, &data[1..]))
}

/// Read a 1-byte unsigned integer
pub fn read_uint8(data: &[u8]) -> Result<(u8, &[u8])> {
    if data.is_empty() {
        return Err(Error::UnexpectedEof);
    }
    Ok((data[0], &data[1..]))
}

/// Read a 2-byte big-endian signed integer
pub fn read_int16(data: &[u8]) -> Result<(i16, &[u8])> {
    if data.len() < 2 {
        return Err(Error::UnexpectedEof);
    }
    let value = I16BE::ref_from_bytes(&data[..2])
        .map_err(|_| Error::Protocol("misaligned int16"))?
        .get();
    Ok((value, &data[2..]))
}

/// Read a 2-byte big-endian unsigned integer
pub fn read_uint16(data: &[u8]) -> Result<(u16, &[u8])> {
    if data.len() < 2 {
        return Err(Error::UnexpectedEof);
    }
    let value = U16BE::ref_from_bytes(&data[..2])
        .map_err(|_| Error::Protocol("misaligned uint16"))?
        .get();
    Ok((value, &data[2..]))
}

/// Read a 4-byte big-endian signed integer
pub fn read_int32(data: &[u8]) -> Result<(i32, &[u8])> {
    if data.len() < 4 {
        return Err(Error::UnexpectedEof);
    }
    let value = I32BE::ref_from_bytes(&data[..4])
        .map_err(|_| Error::Protocol("misaligned int32"))?
        .get();
    Ok((value, &data[4..]))
}

/// Read a `[string]`: uint16 length followed by that many bytes
pub fn read_string(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, rest) = read_uint16(data)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::UnexpectedEof);
    }
    Ok((&rest[..len], &rest[len..]))
}

/// Read a `[long string]`: int32 length followed by that many bytes
pub fn read_long_string(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let (len, rest) = read_int32(data)?;
    if len < 0 {
        return Err(Error::Protocol("negative long string length"));
    }
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::UnexpectedEof);
    }
    Ok((&rest[..len], &rest[len..]))
}

/// Read a `[bytes]`: int32 length (negative means null) followed by the bytes
pub fn read_bytes(data: &[u8]) -> Result<(Option<&[u8]>, &[u8])> {
    let (len, rest) = read_int32(data)?;
    if len < 0 {
        return Ok((None, rest));
    }
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::UnexpectedEof);
    }
    Ok((Some(&rest[..len]), &rest[len..]))
}

/// Write a 1-byte signed integer
pub fn write_int8(out: &mut Vec<u8>, value: i8) {
    out.push(value as u8);
}

/// Write a 1-byte unsigned integer
pub fn write_uint8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

/// Write a 2-byte big-endian signed integer
pub fn write_int16(out: &mut Vec<u8>, value: i16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write a 2-byte big-endian unsigned integer
pub fn write_uint16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write a 4-byte big-endian signed integer
pub fn write_int32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Write a `[string]`
pub fn write_string(out: &mut Vec<u8>, value: &str) {
    write_uint16(out, value.len() as u16);
    out.extend_from_slice(value.as_bytes());
}

/// Write a `[short bytes]`: uint16 length + raw bytes (prepared ids)
pub fn write_short_bytes(out: &mut Vec<u8>, value: &[u8]) {
    write_uint16(out, value.len() as u16);
    out.extend_from_slice(value);
}

/// Write a `[long string]`
pub fn write_long_string(out: &mut Vec<u8>, value: &[u8]) {
    write_int32(out, value.len() as i32);
    out.extend_from_slice(value);
}

/// Write a `[bytes]` value; `None` encodes the null marker
pub fn write_value_bytes(out: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(bytes) => write_long_string(out, bytes),
        None => write_int32(out, -1),
    }
}

/// Write a `[string list]`
pub fn write_string_list(out: &mut Vec<u8>, values: &[&str]) {
    write_uint16(out, values.len() as u16);
    for value in values {
        write_string(out, value);
    }
}

/// Write a collection value: int32 total size, int32 count, count elements
/// each encoded as a `[long string]`
pub fn write_collection(out: &mut Vec<u8>, elements: &[Vec<u8>]) {
    let mut size = 4i32;
    for element in elements {
        size += 4 + element.len() as i32;
    }
    write_int32(out, size);
    write_int32(out, elements.len() as i32);
    for element in elements {
        write_long_string(out, element);
    }
}

/// Parse a textual UUID (`8-4-4-4-12`, dashes optional) into its 16 raw bytes
pub fn parse_uuid(text: &str) -> Result<[u8; 16]> {
    fn hex(byte: u8) -> Result<u8> {
        match byte {
            b'0'..=b'9' => Ok(byte - b'0'),
            b'a'..=b'f' => Ok(byte - b'a' + 10),
            b'A'..=b'F' => Ok(byte - b'A' + 10),
            _ => Err(Error::Protocol("invalid hex digit in uuid")),
        }
    }

    let mut out = [0u8; 16];
    let mut input = text.as_bytes();
    for slot in &mut out {
        if input.first() == Some(&b'-') {
            input = &input[1..];
        }
        if input.len() < 2 {
            return Err(Error::Protocol("uuid too short"));
        }
        *slot = (hex(input[0])? << 4) | hex(input[1])?;
        input = &input[2..];
    }
    if !input.is_empty() {
        return Err(Error::Protocol("uuid too long"));
    }
    Ok(out)
}

/// Raw inet bytes for a textual address: 4 for v4, 16 for v6
pub fn parse_inet(text: &str) -> Result<Vec<u8>> {
    let addr: IpAddr = text
        .parse()
        .map_err(|_| Error::Protocol("invalid inet address"))?;
    Ok(match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    })
}

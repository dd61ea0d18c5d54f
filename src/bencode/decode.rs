use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes a bencode value from a byte slice.
///
/// The input is copied into a fresh buffer once; every byte string in the
/// resulting tree is a zero-copy slice of that buffer. When the data is
/// already held in a [`Bytes`], prefer [`decode_buf`] which avoids the
/// copy entirely.
///
/// The input must contain exactly one complete bencode value with no
/// trailing data.
///
/// # Errors
///
/// Returns an error if:
/// - The input is empty or truncated ([`BencodeError::UnexpectedEof`])
/// - The input contains invalid bencode syntax
/// - An integer overflows `i64` or has leading zeros
///   ([`BencodeError::InvalidInteger`])
/// - The nesting depth exceeds 64 levels ([`BencodeError::NestingTooDeep`])
/// - There is data after the value ([`BencodeError::TrailingData`])
///
/// # Examples
///
/// ```
/// use rdht::bencode::decode;
///
/// let int = decode(b"i42e").unwrap();
/// assert_eq!(int.as_integer(), Some(42));
///
/// let dict = decode(b"d4:name5:Alice3:agei30ee").unwrap();
/// assert_eq!(dict.get(b"name").and_then(|v| v.as_str()), Some("Alice"));
/// ```
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    decode_buf(&Bytes::copy_from_slice(data))
}

/// Decodes a bencode value from a shared buffer.
///
/// Byte strings in the returned tree are slices of `buf`; cloning them is
/// a reference-count bump, and they keep the buffer alive.
pub fn decode_buf(buf: &Bytes) -> Result<Value, BencodeError> {
    let mut pos = 0;
    let value = decode_value(buf, &mut pos, 0)?;

    if pos != buf.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

fn decode_value(buf: &Bytes, pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    if depth > MAX_DEPTH {
        return Err(BencodeError::NestingTooDeep);
    }

    if *pos >= buf.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    match buf[*pos] {
        b'i' => decode_integer(buf, pos),
        b'l' => decode_list(buf, pos, depth),
        b'd' => decode_dict(buf, pos, depth),
        b'0'..=b'9' => decode_bytes(buf, pos),
        c => Err(BencodeError::UnexpectedChar(c as char)),
    }
}

fn decode_integer(buf: &Bytes, pos: &mut usize) -> Result<Value, BencodeError> {
    *pos += 1;

    let start = *pos;
    while *pos < buf.len() && buf[*pos] != b'e' {
        *pos += 1;
    }

    if *pos >= buf.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    let int_str = std::str::from_utf8(&buf[start..*pos])
        .map_err(|_| BencodeError::InvalidInteger("invalid utf8".into()))?;

    if int_str.is_empty() {
        return Err(BencodeError::InvalidInteger("empty".into()));
    }

    if int_str == "-" || int_str.starts_with("-0") || (int_str.starts_with('0') && int_str.len() > 1)
    {
        return Err(BencodeError::InvalidInteger(int_str.into()));
    }

    // parse() also rejects values outside the i64 range
    let value: i64 = int_str
        .parse()
        .map_err(|_| BencodeError::InvalidInteger(int_str.into()))?;

    *pos += 1;
    Ok(Value::Integer(value))
}

fn decode_bytes(buf: &Bytes, pos: &mut usize) -> Result<Value, BencodeError> {
    let start = *pos;
    while *pos < buf.len() && buf[*pos] != b':' {
        *pos += 1;
    }

    if *pos >= buf.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    let len_str =
        std::str::from_utf8(&buf[start..*pos]).map_err(|_| BencodeError::InvalidStringLength)?;

    let len: usize = len_str
        .parse()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    *pos += 1;

    if buf.len() - *pos < len {
        return Err(BencodeError::UnexpectedEof);
    }

    let bytes = buf.slice(*pos..*pos + len);
    *pos += len;

    Ok(Value::Bytes(bytes))
}

fn decode_list(buf: &Bytes, pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    *pos += 1;
    let mut list = Vec::new();

    while *pos < buf.len() && buf[*pos] != b'e' {
        list.push(decode_value(buf, pos, depth + 1)?);
    }

    if *pos >= buf.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    *pos += 1;
    Ok(Value::List(list))
}

fn decode_dict(buf: &Bytes, pos: &mut usize, depth: usize) -> Result<Value, BencodeError> {
    *pos += 1;
    let mut dict = BTreeMap::new();

    while *pos < buf.len() && buf[*pos] != b'e' {
        let key = match decode_value(buf, pos, depth + 1)? {
            Value::Bytes(b) => b,
            _ => return Err(BencodeError::UnexpectedChar(buf[*pos] as char)),
        };

        let value = decode_value(buf, pos, depth + 1)?;
        dict.insert(key, value);
    }

    if *pos >= buf.len() {
        return Err(BencodeError::UnexpectedEof);
    }

    *pos += 1;
    Ok(Value::Dict(dict))
}

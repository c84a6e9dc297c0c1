use bytes::{Buf, BufMut};
use prost::encoding::{decode_varint, encode_varint, encoded_len_varint};

use crate::{Error, Result};

/// A decoded row borrowing its key from the block it was read from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowRef<'a> {
    /// The opaque series identity the row is sharded on.
    pub key: &'a [u8],
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub value: f64,
}

/// Append `b` to `dst` as a varint length followed by the raw bytes.
///
/// This is the encoding of a row key, and of each label name and value
/// inside a key built from labels.
pub fn marshal_bytes(dst: &mut Vec<u8>, b: &[u8]) {
    encode_varint(b.len() as u64, dst);
    dst.put_slice(b);
}

/// The number of bytes [`marshal_row`] appends for a key of `key_len` bytes.
pub fn marshaled_row_len(key_len: usize) -> usize {
    encoded_len_varint(key_len as u64) + key_len + 16
}

/// Append the wire encoding of a row to `dst`.
///
/// The key is written as a varint length and the raw bytes, followed by the
/// timestamp and the value bits as big-endian `u64`s. Rows are concatenated
/// without any separator.
pub fn marshal_row(dst: &mut Vec<u8>, key: &[u8], timestamp: i64, value: f64) {
    dst.reserve(marshaled_row_len(key.len()));
    marshal_bytes(dst, key);
    dst.put_u64(timestamp as u64);
    dst.put_u64(value.to_bits());
}

/// Decode the first row of `src`, returning it along with the remaining tail.
pub fn unmarshal_row(src: &[u8]) -> Result<(RowRef<'_>, &[u8])> {
    let mut tail = src;
    let key_len = decode_varint(&mut tail)
        .map_err(|e| Error::MalformedRow(format!("cannot decode key length: {e}")))?;
    let key_len = usize::try_from(key_len)
        .ok()
        .filter(|&n| n <= tail.len())
        .ok_or_else(|| {
            Error::MalformedRow(format!(
                "key length {key_len} exceeds the {} remaining bytes",
                tail.len()
            ))
        })?;
    let (key, mut tail) = tail.split_at(key_len);

    if tail.len() < 16 {
        return Err(Error::MalformedRow(format!(
            "want 16 bytes of timestamp and value; have {}",
            tail.len()
        )));
    }
    let timestamp = tail.get_u64() as i64;
    let value = f64::from_bits(tail.get_u64());

    Ok((
        RowRef {
            key,
            timestamp,
            value,
        },
        tail,
    ))
}

/// Iterate over the rows of an encoded block.
///
/// Iteration stops after the first error.
pub fn rows(block: &[u8]) -> Rows<'_> {
    Rows { tail: block }
}

/// The iterator returned by [`rows`].
#[derive(Debug, Clone)]
pub struct Rows<'a> {
    tail: &'a [u8],
}

impl<'a> Iterator for Rows<'a> {
    type Item = Result<RowRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.tail.is_empty() {
            return None;
        }
        match unmarshal_row(self.tail) {
            Ok((row, tail)) => {
                self.tail = tail;
                Some(Ok(row))
            }
            Err(e) => {
                self.tail = &[];
                Some(Err(e))
            }
        }
    }
}

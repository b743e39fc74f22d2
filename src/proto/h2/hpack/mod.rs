//! HPACK header compression (RFC 7541).
//!
//! The decoder maintains the dynamic table the peer's encoder feeds; the
//! encoder keeps to static-table references and literal representations,
//! which keeps it stateless and interoperable with any decoder.

mod huffman;
mod table;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use table::DynamicTable;

const INDEXED: u8 = 0x80;
const INCREMENTAL: u8 = 0x40;
const TABLE_SIZE_UPDATE: u8 = 0x20;
const NEVER_INDEXED: u8 = 0x10;
const HUFFMAN: u8 = 0x80;

// ===== primitives =====

fn encode_int(value: usize, prefix_bits: u8, first_byte_flags: u8, dst: &mut BytesMut) {
    let mask = (1usize << prefix_bits) - 1;
    if value < mask {
        dst.put_u8(first_byte_flags | value as u8);
        return;
    }
    dst.put_u8(first_byte_flags | mask as u8);
    let mut rest = value - mask;
    while rest >= 128 {
        dst.put_u8((rest % 128 + 128) as u8);
        rest /= 128;
    }
    dst.put_u8(rest as u8);
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Result<u8> {
        self.src
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::new_http().with_message("truncated header block"))
    }

    fn take(&mut self) -> Result<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.src.len() {
            return Err(Error::new_http().with_message("truncated header block"));
        }
        let slice = &self.src[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn decode_int(&mut self, prefix_bits: u8) -> Result<usize> {
        let mask = (1usize << prefix_bits) - 1;
        let mut value = (self.take()? as usize) & mask;
        if value < mask {
            return Ok(value);
        }
        let mut shift = 0u32;
        loop {
            let byte = self.take()?;
            value = value
                .checked_add(((byte & 0x7f) as usize) << shift)
                .ok_or_else(|| Error::new_http().with_message("header integer overflow"))?;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 28 {
                return Err(Error::new_http().with_message("header integer overflow"));
            }
        }
    }

    fn decode_string(&mut self) -> Result<Bytes> {
        let huffman_coded = self.peek()? & HUFFMAN != 0;
        let len = self.decode_int(7)?;
        let raw = self.take_slice(len)?;
        if huffman_coded {
            let mut decoded = Vec::with_capacity(len * 2);
            huffman::decode(raw, &mut decoded)?;
            Ok(Bytes::from(decoded))
        } else {
            Ok(Bytes::copy_from_slice(raw))
        }
    }
}

// ===== decoder =====

pub(crate) struct Decoder {
    table: DynamicTable,
}

impl Decoder {
    pub(crate) fn new(max_table_size: u32) -> Self {
        Self {
            table: DynamicTable::new(max_table_size as usize),
        }
    }

    /// Decode a complete header block into `(name, value)` pairs.
    pub(crate) fn decode(&mut self, src: &[u8]) -> Result<Vec<(Bytes, Bytes)>> {
        let mut reader = Reader::new(src);
        let mut fields = Vec::new();
        let mut seen_field = false;

        while !reader.is_empty() {
            let first = reader.peek()?;
            if first & INDEXED != 0 {
                let index = reader.decode_int(7)?;
                let (name, value) = self
                    .table
                    .get(index)
                    .ok_or_else(|| Error::new_http().with_message("invalid header index"))?;
                fields.push((name, value));
                seen_field = true;
            } else if first & INCREMENTAL != 0 {
                let index = reader.decode_int(6)?;
                let name = if index == 0 {
                    reader.decode_string()?
                } else {
                    self.table
                        .get(index)
                        .ok_or_else(|| {
                            Error::new_http().with_message("invalid header name index")
                        })?
                        .0
                };
                let value = reader.decode_string()?;
                self.table.insert(name.clone(), value.clone());
                fields.push((name, value));
                seen_field = true;
            } else if first & TABLE_SIZE_UPDATE != 0 {
                // size updates must precede the first field of the block
                if seen_field {
                    return Err(Error::new_http()
                        .with_message("table size update after header field"));
                }
                let size = reader.decode_int(5)?;
                if !self.table.update_size(size) {
                    return Err(Error::new_http()
                        .with_message("table size update beyond negotiated bound"));
                }
            } else {
                // literal without indexing (0000) or never indexed (0001)
                let index = reader.decode_int(4)?;
                let name = if index == 0 {
                    reader.decode_string()?
                } else {
                    self.table
                        .get(index)
                        .ok_or_else(|| {
                            Error::new_http().with_message("invalid header name index")
                        })?
                        .0
                };
                let value = reader.decode_string()?;
                fields.push((name, value));
                seen_field = true;
            }
        }
        Ok(fields)
    }
}

// ===== encoder =====

#[derive(Default)]
pub(crate) struct Encoder;

impl Encoder {
    pub(crate) fn new() -> Self {
        Self
    }

    /// Encode a header list. Field order is preserved.
    pub(crate) fn encode<'a, I>(&mut self, fields: I, dst: &mut BytesMut)
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        for (name, value) in fields {
            if let Some(index) = table::static_full_match(name, value) {
                encode_int(index, 7, INDEXED, dst);
                continue;
            }
            match table::static_name_match(name) {
                Some(index) => {
                    encode_int(index, 4, 0, dst);
                }
                None => {
                    dst.put_u8(0);
                    Self::encode_string(name, dst);
                }
            }
            Self::encode_string(value, dst);
        }
    }

    /// Sensitive fields use the never-indexed representation.
    pub(crate) fn encode_never_indexed(&mut self, name: &[u8], value: &[u8], dst: &mut BytesMut) {
        match table::static_name_match(name) {
            Some(index) => encode_int(index, 4, NEVER_INDEXED, dst),
            None => {
                dst.put_u8(NEVER_INDEXED);
                Self::encode_string(name, dst);
            }
        }
        Self::encode_string(value, dst);
    }

    fn encode_string(data: &[u8], dst: &mut BytesMut) {
        encode_int(data.len(), 7, 0, dst);
        dst.put_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(fields: &[(&str, &str)]) -> Vec<(Bytes, Bytes)> {
        let mut encoder = Encoder::new();
        let mut block = BytesMut::new();
        encoder.encode(
            fields
                .iter()
                .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
            &mut block,
        );
        Decoder::new(4096).decode(&block).unwrap()
    }

    #[test]
    fn static_matches_and_literals() {
        let decoded = roundtrip(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/search?q=1"),
            (":authority", "example.org"),
            ("user-agent", "remora/0.1.0"),
            ("x-custom", "17"),
        ]);
        let as_strings: Vec<(&str, &str)> = decoded
            .iter()
            .map(|(name, value)| {
                (
                    std::str::from_utf8(name).unwrap(),
                    std::str::from_utf8(value).unwrap(),
                )
            })
            .collect();
        assert_eq!(
            as_strings,
            vec![
                (":method", "GET"),
                (":scheme", "https"),
                (":path", "/search?q=1"),
                (":authority", "example.org"),
                ("user-agent", "remora/0.1.0"),
                ("x-custom", "17"),
            ]
        );
    }

    #[test]
    fn full_static_match_is_one_byte() {
        let mut encoder = Encoder::new();
        let mut block = BytesMut::new();
        encoder.encode([(&b":method"[..], &b"GET"[..])], &mut block);
        assert_eq!(&block[..], &[0x82]);
    }

    #[test]
    fn decodes_incremental_indexing_and_reuse() {
        // peer encodes "x-trace: abc" with incremental indexing, then
        // references it by index
        let mut block = BytesMut::new();
        block.put_u8(INCREMENTAL);
        Encoder::encode_string(b"x-trace", &mut block);
        Encoder::encode_string(b"abc", &mut block);
        // dynamic index 62 = 0x80 | 62
        encode_int(62, 7, INDEXED, &mut block);

        let mut decoder = Decoder::new(4096);
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], decoded[1]);
        assert_eq!(&decoded[0].0[..], b"x-trace");
    }

    #[test]
    fn rejects_invalid_index() {
        let mut block = BytesMut::new();
        encode_int(200, 7, INDEXED, &mut block);
        assert!(Decoder::new(4096).decode(&block).is_err());
    }

    #[test]
    fn integer_primitive_multi_byte() {
        // RFC 7541 C.1.2: 1337 with 5-bit prefix = [0x1f, 0x9a, 0x0a]
        let mut dst = BytesMut::new();
        encode_int(1337, 5, 0, &mut dst);
        assert_eq!(&dst[..], &[0x1f, 0x9a, 0x0a]);

        let mut reader = Reader::new(&dst);
        assert_eq!(reader.decode_int(5).unwrap(), 1337);
    }

    #[test]
    fn huffman_coded_value_from_peer() {
        // RFC 7541 C.4.1: ":authority: www.example.com" with huffman value
        let block: &[u8] = &[
            0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4,
            0xff,
        ];
        let mut decoder = Decoder::new(4096);
        let decoded = decoder.decode(block).unwrap();
        assert_eq!(&decoded[0].0[..], b":authority");
        assert_eq!(&decoded[0].1[..], b"www.example.com");
    }
}

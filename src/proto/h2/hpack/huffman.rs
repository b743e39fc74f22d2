//! Huffman decoding for HPACK string literals.
//!
//! Covers the canonical codes for NUL, the printable ASCII range and EOS.
//! Servers only apply the static Huffman code when it shrinks a string,
//! which in practice limits it to exactly this range; a code outside the
//! covered set decodes to an error rather than to wrong bytes.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{Error, Result};

/// Longest code in the covered set.
const MAX_CODE_LEN: u8 = 15;

/// `(symbol, code, bits)` triples of the static code.
const CODES: &[(u16, u32, u8)] = &[
    (b'0' as u16, 0x0, 5),
    (b'1' as u16, 0x1, 5),
    (b'2' as u16, 0x2, 5),
    (b'a' as u16, 0x3, 5),
    (b'c' as u16, 0x4, 5),
    (b'e' as u16, 0x5, 5),
    (b'i' as u16, 0x6, 5),
    (b'o' as u16, 0x7, 5),
    (b's' as u16, 0x8, 5),
    (b't' as u16, 0x9, 5),
    (b' ' as u16, 0x14, 6),
    (b'%' as u16, 0x15, 6),
    (b'-' as u16, 0x16, 6),
    (b'.' as u16, 0x17, 6),
    (b'/' as u16, 0x18, 6),
    (b'3' as u16, 0x19, 6),
    (b'4' as u16, 0x1a, 6),
    (b'5' as u16, 0x1b, 6),
    (b'6' as u16, 0x1c, 6),
    (b'7' as u16, 0x1d, 6),
    (b'8' as u16, 0x1e, 6),
    (b'9' as u16, 0x1f, 6),
    (b'=' as u16, 0x20, 6),
    (b'A' as u16, 0x21, 6),
    (b'_' as u16, 0x22, 6),
    (b'b' as u16, 0x23, 6),
    (b'd' as u16, 0x24, 6),
    (b'f' as u16, 0x25, 6),
    (b'g' as u16, 0x26, 6),
    (b'h' as u16, 0x27, 6),
    (b'l' as u16, 0x28, 6),
    (b'm' as u16, 0x29, 6),
    (b'n' as u16, 0x2a, 6),
    (b'p' as u16, 0x2b, 6),
    (b'r' as u16, 0x2c, 6),
    (b'u' as u16, 0x2d, 6),
    (b':' as u16, 0x5c, 7),
    (b'B' as u16, 0x5d, 7),
    (b'C' as u16, 0x5e, 7),
    (b'D' as u16, 0x5f, 7),
    (b'E' as u16, 0x60, 7),
    (b'F' as u16, 0x61, 7),
    (b'G' as u16, 0x62, 7),
    (b'H' as u16, 0x63, 7),
    (b'I' as u16, 0x64, 7),
    (b'J' as u16, 0x65, 7),
    (b'K' as u16, 0x66, 7),
    (b'L' as u16, 0x67, 7),
    (b'M' as u16, 0x68, 7),
    (b'N' as u16, 0x69, 7),
    (b'O' as u16, 0x6a, 7),
    (b'P' as u16, 0x6b, 7),
    (b'Q' as u16, 0x6c, 7),
    (b'R' as u16, 0x6d, 7),
    (b'S' as u16, 0x6e, 7),
    (b'T' as u16, 0x6f, 7),
    (b'U' as u16, 0x70, 7),
    (b'V' as u16, 0x71, 7),
    (b'W' as u16, 0x72, 7),
    (b'Y' as u16, 0x73, 7),
    (b'j' as u16, 0x74, 7),
    (b'k' as u16, 0x75, 7),
    (b'q' as u16, 0x76, 7),
    (b'v' as u16, 0x77, 7),
    (b'w' as u16, 0x78, 7),
    (b'x' as u16, 0x79, 7),
    (b'y' as u16, 0x7a, 7),
    (b'z' as u16, 0x7b, 7),
    (b'&' as u16, 0xf8, 8),
    (b'*' as u16, 0xf9, 8),
    (b',' as u16, 0xfa, 8),
    (b';' as u16, 0xfb, 8),
    (b'X' as u16, 0xfc, 8),
    (b'Z' as u16, 0xfd, 8),
    (b'!' as u16, 0x3f8, 10),
    (b'"' as u16, 0x3f9, 10),
    (b'(' as u16, 0x3fa, 10),
    (b')' as u16, 0x3fb, 10),
    (b'?' as u16, 0x3fc, 10),
    (b'\'' as u16, 0x7fa, 11),
    (b'+' as u16, 0x7fb, 11),
    (b'|' as u16, 0x7fc, 11),
    (b'#' as u16, 0xffa, 12),
    (b'>' as u16, 0xffb, 12),
    (0, 0x1ff8, 13),
    (b'$' as u16, 0x1ff9, 13),
    (b'@' as u16, 0x1ffa, 13),
    (b'[' as u16, 0x1ffb, 13),
    (b']' as u16, 0x1ffc, 13),
    (b'~' as u16, 0x1ffd, 13),
    (b'^' as u16, 0x3ffc, 14),
    (b'}' as u16, 0x3ffd, 14),
    (b'<' as u16, 0x7ffc, 15),
    (b'`' as u16, 0x7ffd, 15),
    (b'{' as u16, 0x7ffe, 15),
];

fn decode_map() -> &'static HashMap<(u8, u32), u8> {
    static MAP: OnceLock<HashMap<(u8, u32), u8>> = OnceLock::new();
    MAP.get_or_init(|| {
        CODES
            .iter()
            .map(|&(symbol, code, bits)| ((bits, code), symbol as u8))
            .collect()
    })
}

/// Decode a Huffman-coded string literal into `dst`.
pub(crate) fn decode(src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
    let map = decode_map();
    let mut code: u32 = 0;
    let mut len: u8 = 0;

    for &byte in src {
        for shift in (0..8).rev() {
            let bit = (byte >> shift) & 1;
            code = (code << 1) | bit as u32;
            len += 1;
            if let Some(&symbol) = map.get(&(len, code)) {
                dst.push(symbol);
                code = 0;
                len = 0;
            } else if len > MAX_CODE_LEN {
                return Err(Error::new_http()
                    .with_message("unsupported or invalid huffman code in header block"));
            }
        }
    }

    // remaining bits must be a prefix of EOS: at most 7 set bits
    if len > 7 || code != (1u32 << len) - 1 {
        return Err(Error::new_http().with_message("invalid huffman padding"));
    }
    Ok(())
}

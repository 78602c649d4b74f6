//! The relay's dump formats: printed rows and raw hex files.
//!
//! A printed row covers sixteen stream offsets aligned on sixteen and is
//! labelled with the offset of its first byte. A chunk that starts in the
//! middle of a row leaves the columns already printed by earlier chunks
//! blank, in the hex part and in the ASCII part:
//!
//! ```text
//! 00000000  41 41 41 0a                                       |AAA.            |
//! 00000004              42 42 0a                              |    BB.         |
//! ```
//!
//! Raw hex files are plain digit pairs with a newline after every sixteenth
//! stream byte.

use std::fmt::Write as _;

const ROW: usize = 16;
const HALF: usize = 8;

/// Rows for a chunk of `data` that starts at stream offset `offset`.
pub fn rows(offset: usize, data: &[u8]) -> String {
    let mut out = String::new();
    let mut at = offset;
    let mut rest = data;

    while !rest.is_empty() {
        let skip = at % ROW;
        let (row, tail) = rest.split_at(rest.len().min(ROW - skip));
        let column = |c: usize| c.checked_sub(skip).and_then(|i| row.get(i)).copied();

        let _ = write!(out, "{:08x}  ", at);
        for c in 0..ROW {
            if c == HALF {
                out.push(' ');
            }
            match column(c) {
                Some(byte) => {
                    let _ = write!(out, "{:02x} ", byte);
                }
                None => out.push_str("   "),
            }
        }
        out.push_str(" |");
        for c in 0..ROW {
            out.push(match column(c) {
                Some(byte) if byte == b' ' || byte.is_ascii_graphic() => byte as char,
                Some(_) => '.',
                None => ' ',
            });
        }
        out.push_str("|\n");

        at += row.len();
        rest = tail;
    }
    out
}

/// Raw hex file content for a chunk of `data` starting at stream `offset`.
pub fn raw_hex(offset: usize, data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + data.len() / ROW + 1);
    for (i, byte) in data.iter().enumerate() {
        let _ = write!(out, "{:02x}", byte);
        if (offset + i) % ROW == ROW - 1 {
            out.push('\n');
        }
    }
    out
}

/// Error decoding a raw hex dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidHex {
    /// Offset of the offending character in the input.
    pub position: usize,
}

impl std::fmt::Display for InvalidHex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid raw hex at character {}", self.position)
    }
}

impl std::error::Error for InvalidHex {}

/// Decode a raw hex file: hex digit pairs, whitespace ignored.
pub fn decode_raw_hex(text: &str) -> Result<Vec<u8>, InvalidHex> {
    let mut out = Vec::with_capacity(text.len() / 2);
    let mut high: Option<(usize, u8)> = None;

    for (position, c) in text.char_indices() {
        if c.is_ascii_whitespace() {
            continue;
        }
        let nibble = c.to_digit(16).ok_or(InvalidHex { position })? as u8;
        match high.take() {
            None => high = Some((position, nibble)),
            Some((_, h)) => out.push((h << 4) | nibble),
        }
    }

    match high {
        Some((position, _)) => Err(InvalidHex { position }),
        None => Ok(out),
    }
}

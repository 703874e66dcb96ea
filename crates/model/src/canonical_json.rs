//! ASCII-only compact JSON.
//!
//! Output matches Python's `json.dumps(value, ensure_ascii=True,
//! separators=(",", ":"))`: serde_json's own escapes for quotes, backslashes
//! and control characters, and every non-ASCII character written as
//! `\uXXXX` (UTF-16 surrogate pairs above the BMP). Key order is whatever
//! the serialized value declares.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;

/// Compact formatter that escapes non-ASCII characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start: usize = 0;
        for (index, ch) in fragment.char_indices() {
            if ch.is_ascii() {
                continue;
            }
            writer.write_all(fragment[start..index].as_bytes())?;
            let mut units: [u16; 2] = [0; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = index + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}

/// Serialize `value` as compact JSON with non-ASCII characters escaped.
pub fn to_ascii_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let mut out: Vec<u8> = Vec::with_capacity(128);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
    value.serialize(&mut serializer)?;
    // The formatter only ever writes ASCII.
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Compare strings by their UTF-16 code units.
pub(crate) fn utf16_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

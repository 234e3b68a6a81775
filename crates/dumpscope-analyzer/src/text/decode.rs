//! Incremental byte to text decoding into pooled buffers
//!
//! Decoders write UTF-8 into the unfilled tail of a [`BytesMut`] and never
//! split a character, so every buffer segment handed out later is valid UTF-8.

use std::fmt;
use std::str::FromStr;

use bytes::BytesMut;

use dumpscope_core::prelude::*;

/// UTF-8 encoding of U+FFFD
const REPLACEMENT: &[u8] = "\u{FFFD}".as_bytes();

/// Longest UTF-8 sequence a decoder may need to write at once
pub const MAX_CHAR_BYTES: usize = 4;

/// Outcome of one decode call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decoded {
    /// Input bytes consumed (including bytes parked in decoder state)
    pub consumed: usize,
    /// Output bytes appended
    pub written: usize,
}

/// Pluggable byte to text conversion
pub trait TextDecoder: Send {
    /// Decode as much of `input` as fits into the spare capacity of `out`.
    ///
    /// Must never grow `out` beyond its capacity and must only append whole
    /// characters.
    fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> Decoded;

    /// Flush state at end of stream. Returns bytes written, or `None` when
    /// `out` lacks room for the pending output.
    fn finish(&mut self, out: &mut BytesMut) -> Option<usize>;
}

fn spare(out: &BytesMut) -> usize {
    out.capacity() - out.len()
}

// ─────────────────────────────────────────────────────────────────────────────
// UTF-8
// ─────────────────────────────────────────────────────────────────────────────

/// Validating pass-through decoder that carries split sequences between calls
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: [u8; MAX_CHAR_BYTES],
    pending_len: usize,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expected length of a sequence starting with `lead`, `None` if invalid
    fn sequence_len(lead: u8) -> Option<usize> {
        match lead {
            0x00..=0x7F => Some(1),
            0xC2..=0xDF => Some(2),
            0xE0..=0xEF => Some(3),
            0xF0..=0xF4 => Some(4),
            _ => None,
        }
    }

    /// Complete a sequence parked by a previous call
    ///
    /// Returns `(consumed, written, blocked)`; `blocked` means `out` is full.
    fn resume_pending(&mut self, input: &[u8], out: &mut BytesMut) -> (usize, usize, bool) {
        let want = Self::sequence_len(self.pending[0]).unwrap_or(1);
        let mut consumed = 0;
        while self.pending_len < want && consumed < input.len() {
            let byte = input[consumed];
            if byte & 0xC0 != 0x80 {
                break;
            }
            self.pending[self.pending_len] = byte;
            self.pending_len += 1;
            consumed += 1;
        }

        if self.pending_len < want && consumed == input.len() {
            // Still incomplete, wait for more input.
            return (consumed, 0, false);
        }

        let complete = &self.pending[..self.pending_len];
        let bytes = match std::str::from_utf8(complete) {
            Ok(_) => complete,
            Err(_) => REPLACEMENT,
        };
        if spare(out) < bytes.len() {
            // Un-consume what we took so the retry sees the same input.
            self.pending_len -= consumed;
            return (0, 0, true);
        }
        out.extend_from_slice(bytes);
        let written = bytes.len();
        self.pending_len = 0;
        (consumed, written, false)
    }
}

impl TextDecoder for Utf8Decoder {
    fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> Decoded {
        let mut consumed = 0;
        let mut written = 0;

        if self.pending_len > 0 {
            let (c, w, blocked) = self.resume_pending(input, out);
            consumed += c;
            written += w;
            if blocked || self.pending_len > 0 {
                return Decoded { consumed, written };
            }
        }

        while consumed < input.len() {
            let room = spare(out);
            if room == 0 {
                break;
            }
            let rest = &input[consumed..];
            let window = &rest[..rest.len().min(room)];
            let truncated = window.len() < rest.len();

            match std::str::from_utf8(window) {
                Ok(_) => {
                    out.extend_from_slice(window);
                    consumed += window.len();
                    written += window.len();
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.extend_from_slice(&window[..valid]);
                    consumed += valid;
                    written += valid;

                    match e.error_len() {
                        Some(bad) => {
                            if spare(out) < REPLACEMENT.len() {
                                break;
                            }
                            out.extend_from_slice(REPLACEMENT);
                            consumed += bad;
                            written += REPLACEMENT.len();
                        }
                        // Cut by the output window: the character does not fit.
                        None if truncated => break,
                        // Cut by the end of input: park it for the next call.
                        None => {
                            let tail = &window[valid..];
                            self.pending[..tail.len()].copy_from_slice(tail);
                            self.pending_len = tail.len();
                            consumed += tail.len();
                        }
                    }
                }
            }
        }

        Decoded { consumed, written }
    }

    fn finish(&mut self, out: &mut BytesMut) -> Option<usize> {
        if self.pending_len == 0 {
            return Some(0);
        }
        if spare(out) < REPLACEMENT.len() {
            return None;
        }
        out.extend_from_slice(REPLACEMENT);
        self.pending_len = 0;
        Some(REPLACEMENT.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Single-byte code pages
// ─────────────────────────────────────────────────────────────────────────────

/// Upper half of IBM code page 437 (0x80..=0xFF)
static CP437_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å', //
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ', //
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»', //
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐', //
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧', //
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀', //
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩', //
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{A0}',
];

/// Stateless table-driven decoder for 8-bit code pages
#[derive(Debug, Clone, Copy)]
pub struct SingleByteDecoder {
    /// Mapping for bytes >= 0x80; `None` means identity (Latin-1)
    high: Option<&'static [char; 128]>,
}

impl SingleByteDecoder {
    pub fn cp437() -> Self {
        Self {
            high: Some(&CP437_HIGH),
        }
    }

    pub fn latin1() -> Self {
        Self { high: None }
    }

    fn map(&self, byte: u8) -> char {
        match (byte, self.high) {
            (0x00..=0x7F, _) => byte as char,
            (_, Some(table)) => table[(byte - 0x80) as usize],
            (_, None) => char::from(byte),
        }
    }
}

impl TextDecoder for SingleByteDecoder {
    fn decode(&mut self, input: &[u8], out: &mut BytesMut) -> Decoded {
        let mut consumed = 0;
        let mut written = 0;
        let mut utf8 = [0u8; MAX_CHAR_BYTES];

        for &byte in input {
            let encoded = self.map(byte).encode_utf8(&mut utf8);
            if spare(out) < encoded.len() {
                break;
            }
            out.extend_from_slice(encoded.as_bytes());
            consumed += 1;
            written += encoded.len();
        }

        Decoded { consumed, written }
    }

    fn finish(&mut self, _out: &mut BytesMut) -> Option<usize> {
        Some(0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding selection
// ─────────────────────────────────────────────────────────────────────────────

/// Text encoding of a debugger's standard streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    /// OEM United States, the default console code page of many Windows hosts
    Cp437,
    Latin1,
}

impl Encoding {
    pub fn decoder(&self) -> Box<dyn TextDecoder> {
        match self {
            Encoding::Utf8 => Box::new(Utf8Decoder::new()),
            Encoding::Cp437 => Box::new(SingleByteDecoder::cp437()),
            Encoding::Latin1 => Box::new(SingleByteDecoder::latin1()),
        }
    }

    /// Encode command text. Characters a single-byte page cannot represent
    /// become `?`.
    pub fn encode_into(&self, text: &str, out: &mut Vec<u8>) {
        match self {
            Encoding::Utf8 => out.extend_from_slice(text.as_bytes()),
            Encoding::Cp437 => out.extend(text.chars().map(|c| {
                if c.is_ascii() {
                    c as u8
                } else {
                    CP437_HIGH
                        .iter()
                        .position(|&mapped| mapped == c)
                        .map(|i| 0x80 + i as u8)
                        .unwrap_or(b'?')
                }
            })),
            Encoding::Latin1 => out.extend(
                text.chars()
                    .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?')),
            ),
        }
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "cp437" | "ibm437" | "437" => Ok(Encoding::Cp437),
            "latin1" | "iso-8859-1" | "28591" => Ok(Encoding::Latin1),
            other => Err(Error::config_invalid(format!("unknown encoding '{}'", other))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Utf8 => write!(f, "utf-8"),
            Encoding::Cp437 => write!(f, "cp437"),
            Encoding::Latin1 => write!(f, "latin1"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Newline token
// ─────────────────────────────────────────────────────────────────────────────

/// Line delimiter of one or two ASCII characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Newline {
    token: [u8; 2],
    len: u8,
}

impl Newline {
    pub const LF: Newline = Newline {
        token: [b'\n', 0],
        len: 1,
    };
    pub const CRLF: Newline = Newline {
        token: [b'\r', b'\n'],
        len: 2,
    };

    /// Newline convention of the host platform
    pub fn platform() -> Self {
        if cfg!(windows) {
            Self::CRLF
        } else {
            Self::LF
        }
    }

    /// Custom delimiter; must be one or two ASCII characters
    pub fn new(token: &str) -> Result<Self> {
        let bytes = token.as_bytes();
        if bytes.is_empty() || bytes.len() > 2 || !token.is_ascii() {
            return Err(Error::config_invalid(format!(
                "newline must be 1-2 ASCII characters, got {:?}",
                token
            )));
        }
        let mut buf = [0u8; 2];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            token: buf,
            len: bytes.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.token[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Position of the first delimiter in `haystack`
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        let token = self.as_bytes();
        match token {
            [single] => haystack.iter().position(|b| b == single),
            _ => haystack.windows(token.len()).position(|w| w == token),
        }
    }
}

impl FromStr for Newline {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lf" => Ok(Newline::LF),
            "crlf" => Ok(Newline::CRLF),
            "platform" => Ok(Newline::platform()),
            other => Err(Error::config_invalid(format!("unknown newline '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut dyn TextDecoder, chunks: &[&[u8]], capacity: usize) -> String {
        let mut out = BytesMut::with_capacity(capacity);
        for chunk in chunks {
            let mut rest: &[u8] = chunk;
            while !rest.is_empty() {
                let d = decoder.decode(rest, &mut out);
                assert!(d.consumed > 0, "decoder stalled with room left");
                rest = &rest[d.consumed..];
            }
        }
        decoder.finish(&mut out).unwrap();
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn test_utf8_passthrough() {
        let mut d = Utf8Decoder::new();
        assert_eq!(decode_all(&mut d, &[b"hello world"], 64), "hello world");
    }

    #[test]
    fn test_utf8_sequence_split_across_calls() {
        let text = "naïve café ☕";
        let bytes = text.as_bytes();
        for cut in 1..bytes.len() {
            let mut d = Utf8Decoder::new();
            let (a, b) = bytes.split_at(cut);
            assert_eq!(decode_all(&mut d, &[a, b], 64), text, "cut at {}", cut);
        }
    }

    #[test]
    fn test_utf8_invalid_byte_becomes_replacement() {
        let mut d = Utf8Decoder::new();
        assert_eq!(decode_all(&mut d, &[b"a\xFFb"], 64), "a\u{FFFD}b");
    }

    #[test]
    fn test_utf8_truncated_at_end_flushes_replacement() {
        let mut d = Utf8Decoder::new();
        assert_eq!(decode_all(&mut d, &[b"ok\xE2\x98"], 64), "ok\u{FFFD}");
    }

    #[test]
    fn test_utf8_never_splits_character_at_capacity() {
        let mut d = Utf8Decoder::new();
        let mut out = BytesMut::with_capacity(4);
        let input = "ab☕".as_bytes();
        let first = d.decode(input, &mut out);
        // "ab" fits, the 3-byte cup does not.
        assert_eq!(first.consumed, 2);
        assert_eq!(&out[..], b"ab");
        assert_eq!(out.capacity() - out.len(), 2);
    }

    #[test]
    fn test_cp437_maps_high_bytes() {
        let mut d = SingleByteDecoder::cp437();
        assert_eq!(decode_all(&mut d, &[b"\x80\xE1 \xFB\xC4"], 64), "Çß √─");
    }

    #[test]
    fn test_latin1_identity() {
        let mut d = SingleByteDecoder::latin1();
        assert_eq!(decode_all(&mut d, &[b"caf\xE9"], 64), "café");
    }

    #[test]
    fn test_single_byte_stops_when_full() {
        let mut d = SingleByteDecoder::cp437();
        let mut out = BytesMut::with_capacity(3);
        let result = d.decode(b"a\x80b", &mut out);
        // 'a' (1 byte) + 'Ç' (2 bytes) fill the buffer.
        assert_eq!(result.consumed, 2);
        assert_eq!(result.written, 3);
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("UTF-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("cp437".parse::<Encoding>().unwrap(), Encoding::Cp437);
        assert_eq!("latin1".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert!("ebcdic".parse::<Encoding>().is_err());
    }

    #[test]
    fn test_encode_into_single_byte_replaces_unmappable() {
        let mut out = Vec::new();
        Encoding::Cp437.encode_into("dumpobj Ç€", &mut out);
        assert_eq!(out, b"dumpobj \x80?");

        out.clear();
        Encoding::Latin1.encode_into("é☕", &mut out);
        assert_eq!(out, b"\xE9?");
    }

    #[test]
    fn test_newline_find() {
        assert_eq!(Newline::LF.find(b"abc\ndef"), Some(3));
        assert_eq!(Newline::CRLF.find(b"abc\ndef\r\n"), Some(7));
        assert_eq!(Newline::CRLF.find(b"abc\r"), None);
    }

    #[test]
    fn test_newline_validation() {
        assert!(Newline::new("").is_err());
        assert!(Newline::new("abc").is_err());
        assert_eq!(Newline::new("\r\n").unwrap(), Newline::CRLF);
        assert_eq!("lf".parse::<Newline>().unwrap(), Newline::LF);
    }
}

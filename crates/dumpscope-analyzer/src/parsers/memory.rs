//! Raw memory dump rows (`dd`, `dw`, `dq`)

use super::cursor::{parse_hex, Cursor};

/// `address: v1 v2 ...` with values in hex.
///
/// Both `7f4e2a400020: 0048 0069` (dotnet-dump) and
/// `00007f4e`2a400020  0048 0069` (WinDbg) are accepted. Parsing stops at the
/// first non-hex token, which drops WinDbg's trailing ASCII column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLine {
    pub address: u64,
    pub values: Vec<u64>,
}

pub fn parse_memory_line(line: &str) -> Option<MemoryLine> {
    let mut cursor = Cursor::new(line);
    let address_token = cursor.token()?;
    let address = parse_hex(address_token)?;

    let mut values = Vec::new();
    while let Some(token) = cursor.peek() {
        if token.ends_with(':') || token.contains('(') {
            break;
        }
        match parse_hex(token) {
            Some(value) => {
                values.push(value);
                cursor.token();
            }
            None => break,
        }
    }
    (!values.is_empty()).then_some(MemoryLine { address, values })
}

/// Decode UTF-16 code units read from a string's character array.
///
/// Unpaired surrogates become U+FFFD.
pub fn decode_utf16_units(units: &[u64]) -> String {
    let units = units.iter().map(|&unit| (unit & 0xffff) as u16);
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotnet_dump_dword_line() {
        assert_eq!(
            parse_memory_line("7f4e2a400020:  0000000d"),
            Some(MemoryLine {
                address: 0x7f4e_2a40_0020,
                values: vec![0xd]
            })
        );
    }

    #[test]
    fn test_windbg_word_line_with_ascii_column() {
        let line = parse_memory_line("00007f4e`2a400024  0048 0069 0021  Hi!").unwrap();
        assert_eq!(line.address, 0x7f4e_2a40_0024);
        assert_eq!(line.values, vec![0x48, 0x69, 0x21]);
    }

    #[test]
    fn test_rejects_non_memory_lines() {
        assert_eq!(parse_memory_line("Name: System.String"), None);
        assert_eq!(parse_memory_line("7f4e2a400020:"), None);
        assert_eq!(parse_memory_line(""), None);
    }

    #[test]
    fn test_decode_utf16() {
        assert_eq!(decode_utf16_units(&[0x48, 0x69]), "Hi");
        assert_eq!(decode_utf16_units(&[0xd83d, 0xde00]), "\u{1F600}");
        assert_eq!(decode_utf16_units(&[0xd83d, 0x41]), "\u{FFFD}A");
    }
}

//! `dumpheap` rows

use dumpscope_core::{HeapEntry, TypeStatistic};

use super::cursor::Cursor;

/// Outcome of parsing one `dumpheap` object row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapLine {
    Object(HeapEntry),
    /// A free-space block; carries no object
    Free,
}

/// `address methodtable size [Free]`
///
/// `live` is stamped onto the entry since the row itself does not say which
/// listing it came from.
pub fn parse_heap_entry(line: &str, live: bool) -> Option<HeapLine> {
    let mut cursor = Cursor::new(line);
    let address = cursor.hex_u64()?;
    let method_table = cursor.hex_u64()?;
    let size_bytes = cursor.dec_u64()?;

    match cursor.remainder() {
        None => Some(HeapLine::Object(HeapEntry {
            address,
            method_table,
            size_bytes,
            live,
        })),
        Some("Free") => Some(HeapLine::Free),
        Some(_) => None,
    }
}

/// `methodtable count totalsize type-name`
///
/// Shared by `dumpheap -stat` and the statistics section of `gchandles`.
pub fn parse_type_statistic(line: &str) -> Option<TypeStatistic> {
    let mut cursor = Cursor::new(line);
    let method_table = cursor.hex_u64()?;
    let count = cursor.dec_u64()?;
    let total_size = cursor.dec_u64()?;
    let type_name = cursor.remainder()?;
    Some(TypeStatistic {
        method_table,
        count,
        total_size,
        type_name: type_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_entry_live() {
        let line = "  00007ffe12340000  00007ffe00010000         24     ";
        assert_eq!(
            parse_heap_entry(line, true),
            Some(HeapLine::Object(HeapEntry {
                address: 0x0000_7ffe_1234_0000,
                method_table: 0x0000_7ffe_0001_0000,
                size_bytes: 24,
                live: true,
            }))
        );
    }

    #[test]
    fn test_heap_entry_free() {
        let line = "  00007ffe12340000  00007ffe00010000         24 Free";
        assert_eq!(parse_heap_entry(line, true), Some(HeapLine::Free));
    }

    #[test]
    fn test_heap_entry_dead_flag() {
        let Some(HeapLine::Object(entry)) = parse_heap_entry("7f4e2a400018 7f4e2e9a1b48 1,024", false)
        else {
            panic!("row should parse");
        };
        assert!(!entry.live);
        assert_eq!(entry.size_bytes, 1024);
    }

    #[test]
    fn test_heap_entry_rejects_other_rows() {
        assert_eq!(parse_heap_entry("         Address               MT           Size", true), None);
        assert_eq!(parse_heap_entry("Statistics:", true), None);
        assert_eq!(
            parse_heap_entry("7f4e2e9a1b48       10          240 System.String", true),
            None
        );
        assert_eq!(parse_heap_entry("", true), None);
    }

    #[test]
    fn test_type_statistic() {
        let stat = parse_type_statistic(
            "00007ffe8a6c1e18     1,234       56,789 System.Collections.Generic.Dictionary`2[[System.String, System.Private.CoreLib],[System.Object, System.Private.CoreLib]]",
        )
        .unwrap();
        assert_eq!(stat.method_table, 0x7ffe_8a6c_1e18);
        assert_eq!(stat.count, 1234);
        assert_eq!(stat.total_size, 56_789);
        assert!(stat.type_name.starts_with("System.Collections.Generic.Dictionary`2[["));
        assert!(stat.type_name.ends_with("]]"));
    }

    #[test]
    fn test_type_statistic_rejects_headers_and_totals() {
        assert_eq!(parse_type_statistic("              MT    Count    TotalSize Class Name"), None);
        assert_eq!(parse_type_statistic("Total 12 objects, 240 bytes"), None);
        assert_eq!(parse_type_statistic("00007ffe8a6c1e18 3 72"), None);
    }
}

//! GC heap layout, handle and per-heap statistics rows

use dumpscope_core::{GcGenerationStart, GcHandle, GcHeapStat, HeapSegment};

use super::cursor::{parse_dec, Cursor};

/// `generation N starts at 0x...`
pub fn parse_generation_start(line: &str) -> Option<GcGenerationStart> {
    let mut cursor = Cursor::new(line);
    if !cursor.literal("generation") {
        return None;
    }
    let generation = u32::try_from(cursor.dec_u64()?).ok()?;
    if !cursor.literal("starts at") {
        return None;
    }
    let start = cursor.hex_u64()?;
    cursor.is_at_end().then_some(GcGenerationStart { generation, start })
}

/// `segment begin allocated size` row of `eeheap -gc`.
///
/// The size column reads `0xf1fe8(991208)`; the hex part is authoritative.
pub fn parse_heap_segment(line: &str) -> Option<HeapSegment> {
    let mut cursor = Cursor::new(line);
    let segment = cursor.hex_u64()?;
    let begin = cursor.hex_u64()?;
    let allocated = cursor.hex_u64()?;
    let size_bytes = cursor.hex_u64()?;
    if !cursor.is_at_end() || allocated < begin {
        return None;
    }
    Some(HeapSegment {
        segment,
        begin,
        allocated,
        size_bytes,
    })
}

/// `handle kind object size [data] type` row of `gchandles`
pub fn parse_gc_handle(line: &str) -> Option<GcHandle> {
    let mut cursor = Cursor::new(line);
    let handle = cursor.hex_u64()?;
    let kind = cursor.token()?;
    if !kind.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    let object = cursor.hex_u64()?;
    let size_bytes = cursor.dec_u64()?;

    // Data is only present when a type name still follows it
    let mut lookahead = cursor;
    let data = match lookahead.hex_u64() {
        Some(value) if !lookahead.is_at_end() => {
            cursor = lookahead;
            Some(value)
        }
        _ => None,
    };
    let type_name = cursor.remainder()?;

    Some(GcHandle {
        handle,
        kind: kind.to_string(),
        object,
        size_bytes,
        data,
        type_name: type_name.to_string(),
    })
}

/// One per-heap row of `gcheapstat`: `name gen0 gen1 gen2 loh [poh] [...]`
///
/// Columns past POH (frozen segments on newer runtimes) are accepted and
/// dropped. Rows carrying anything other than numbers, such as the
/// percentages in the free-space section, are rejected.
pub fn parse_gc_heap_stat(line: &str) -> Option<GcHeapStat> {
    let mut cursor = Cursor::new(line);
    let heap = cursor.token()?;
    if parse_dec(heap).is_some() {
        return None;
    }

    let mut sizes = Vec::with_capacity(6);
    while let Some(size) = cursor.dec_u64() {
        sizes.push(size);
    }
    if sizes.len() < 4 || !cursor.is_at_end() {
        return None;
    }

    Some(GcHeapStat {
        heap: heap.trim_end_matches(':').to_string(),
        gen0: sizes[0],
        gen1: sizes[1],
        gen2: sizes[2],
        loh: sizes[3],
        poh: sizes.get(4).copied(),
    })
}

/// Total line of `gchandles`/`dumpheap` statistics: `Total N objects`
pub fn parse_total_objects(line: &str) -> Option<u64> {
    let mut cursor = Cursor::new(line);
    if !cursor.literal("Total") {
        return None;
    }
    let count = cursor.token().and_then(|t| parse_dec(t.trim_end_matches(',')))?;
    cursor.literal("objects").then_some(count)
}

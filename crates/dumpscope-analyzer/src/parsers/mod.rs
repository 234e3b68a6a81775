//! Record parsers for debugger output lines
//!
//! Every parser is a pure `fn(&str) -> Option<Record>` making a single
//! forward pass over the line. `None` means "not this shape" and is the normal
//! outcome for headers, separators and rows of other sections; callers try a
//! line against the shapes a command can produce and skip the rest.
//!
//! Numbers follow SOS conventions: addresses and method tables in hex without
//! a prefix (WinDbg backticks and an occasional `0x` tolerated), counts and
//! sizes in decimal with optional `,` separators.

pub mod cursor;
pub mod gc;
pub mod heap;
pub mod memory;
pub mod objects;
pub mod stack;

pub use cursor::{labeled, parse_dec, parse_hex, Cursor};
pub use gc::{
    parse_gc_handle, parse_gc_heap_stat, parse_generation_start, parse_heap_segment,
    parse_total_objects,
};
pub use heap::{parse_heap_entry, parse_type_statistic, HeapLine};
pub use memory::{decode_utf16_units, parse_memory_line, MemoryLine};
pub use objects::{
    parse_array_element, parse_array_length, parse_async_state_machine, parse_class_header,
    parse_delegate, parse_element_method_table, parse_field, parse_object_header, ClassHeader,
    ObjectHeader,
};
pub use stack::{parse_stack_frame, parse_thread};

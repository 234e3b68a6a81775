//! Typed facts extracted from debugger output
//!
//! Every record is a plain value: addresses are `u64`, names are owned
//! strings copied out of the pooled line buffers before those are released.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Managed heap
// ─────────────────────────────────────────────────────────────────────────────

/// One object row of `dumpheap`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapEntry {
    pub address: u64,
    pub method_table: u64,
    pub size_bytes: u64,
    /// `true` when the entry came from `dumpheap -live`, `false` for `-dead`
    pub live: bool,
}

/// Which objects `dumpheap` should list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeapScope {
    Live,
    Dead,
}

impl HeapScope {
    pub fn is_live(&self) -> bool {
        matches!(self, HeapScope::Live)
    }
}

/// One row of a per-type statistics table (`dumpheap -stat`, `gchandles`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStatistic {
    pub method_table: u64,
    pub count: u64,
    pub total_size: u64,
    pub type_name: String,
}

/// Field row printed by `dumpobj`
///
/// `MT Field Offset Type VT Attr Value Name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldOffset {
    pub method_table: u64,
    pub field_token: u64,
    pub offset: u64,
    pub field_type: String,
    pub value_type: bool,
    pub is_static: bool,
    pub value: String,
    pub name: String,
}

/// Header and fields of a `dumpobj` response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDetails {
    pub address: u64,
    pub type_name: String,
    pub method_table: u64,
    pub ee_class: u64,
    pub size_bytes: u64,
    pub fields: Vec<FieldOffset>,
}

/// Header of a `dumpmt` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodTableDetails {
    pub method_table: u64,
    pub ee_class: u64,
    pub type_name: String,
}

/// Class metadata from `dumpclass`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EEClassDetails {
    pub ee_class: u64,
    pub class_name: String,
    /// Zero for `System.Object`, which has no parent
    pub parent_ee_class: u64,
}

/// Shape and contents of a single-dimension array from `dumparray`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrayDetails {
    pub address: u64,
    pub method_table: u64,
    pub element_method_table: Option<u64>,
    pub length: u64,
    /// Element addresses for reference-type arrays; `None` entries are null
    pub elements: Vec<Option<u64>>,
}

/// Target and method of a delegate from `dumpdelegate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateMethodDetails {
    pub target: u64,
    pub method_desc: u64,
    pub method_name: String,
}

/// One state machine row from `dumpasync`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncStateMachineDetails {
    pub address: u64,
    pub method_table: u64,
    pub size_bytes: u64,
    /// Compiler-generated `<>1__state`; absent when SOS omits the column
    pub state: Option<i64>,
    pub description: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Threads and stacks
// ─────────────────────────────────────────────────────────────────────────────

/// One row of `threads`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadDetails {
    pub index: u32,
    pub os_thread_id: u32,
    pub is_current: bool,
}

/// One managed frame from `clrstack`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerStackFrame {
    pub stack_pointer: u64,
    pub instruction_pointer: u64,
    pub call_site: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// GC
// ─────────────────────────────────────────────────────────────────────────────

/// `generation N starts at 0x...`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcGenerationStart {
    pub generation: u32,
    pub start: u64,
}

/// One segment row from `eeheap -gc`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapSegment {
    pub segment: u64,
    pub begin: u64,
    pub allocated: u64,
    pub size_bytes: u64,
}

/// Generation boundaries and segments of the GC heap
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcHeapLayout {
    pub generations: Vec<GcGenerationStart>,
    pub segments: Vec<HeapSegment>,
}

/// One handle row from `gchandles`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcHandle {
    pub handle: u64,
    pub kind: String,
    pub object: u64,
    pub size_bytes: u64,
    pub data: Option<u64>,
    pub type_name: String,
}

impl GcHandle {
    /// Pinned and async-pinned handles keep their target from moving
    pub fn is_pinned(&self) -> bool {
        self.kind == "Pinned" || self.kind == "AsyncPinned"
    }
}

/// Handles and per-type statistics from `gchandles`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcHandleReport {
    pub handles: Vec<GcHandle>,
    pub statistics: Vec<TypeStatistic>,
}

/// One per-heap row from `gcheapstat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcHeapStat {
    pub heap: String,
    pub gen0: u64,
    pub gen1: u64,
    pub gen2: u64,
    pub loh: u64,
    pub poh: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_scope_is_live() {
        assert!(HeapScope::Live.is_live());
        assert!(!HeapScope::Dead.is_live());
    }

    #[test]
    fn test_gc_handle_is_pinned() {
        let mut handle = GcHandle {
            handle: 0x1000,
            kind: "Pinned".to_string(),
            object: 0x2000,
            size_bytes: 24,
            data: None,
            type_name: "System.Byte[]".to_string(),
        };
        assert!(handle.is_pinned());

        handle.kind = "Strong".to_string();
        assert!(!handle.is_pinned());
    }

    #[test]
    fn test_heap_entry_serializes_camel_case() {
        let entry = HeapEntry {
            address: 1,
            method_table: 2,
            size_bytes: 24,
            live: true,
        };
        let json = serde_json::to_value(entry).unwrap();
        assert_eq!(json["methodTable"], 2);
        assert_eq!(json["sizeBytes"], 24);
    }
}

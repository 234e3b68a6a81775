//! Object, type and class inspection output
//!
//! Covers `dumpobj`/`do`, `dumpmt`, `dumpclass`, `dumparray`, `dumpdelegate`
//! and `dumpasync`.

use dumpscope_core::{AsyncStateMachineDetails, DelegateMethodDetails, FieldOffset};

use super::cursor::{labeled, parse_dec, parse_hex, Cursor};

/// Labeled header line of `dumpobj`, `dumpmt` and `dumparray`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectHeader {
    Name(String),
    MethodTable(u64),
    EEClass(u64),
    /// `Size: 28(0x1c) bytes`
    Size(u64),
    /// `String: <text>` preview printed for `System.String`
    StringPreview(String),
}

pub fn parse_object_header(line: &str) -> Option<ObjectHeader> {
    if let Some(name) = labeled(line, "Name") {
        return Some(ObjectHeader::Name(name.to_string()));
    }
    if let Some(value) = labeled(line, "MethodTable") {
        return parse_hex(value).map(ObjectHeader::MethodTable);
    }
    if let Some(value) = labeled(line, "EEClass") {
        return parse_hex(value).map(ObjectHeader::EEClass);
    }
    if let Some(value) = labeled(line, "Size") {
        let digits = value.split(['(', ' ']).next()?;
        return parse_dec(digits).map(ObjectHeader::Size);
    }
    labeled(line, "String").map(|text| ObjectHeader::StringPreview(text.to_string()))
}

/// `MT Field Offset Type VT Attr Value Name`
pub fn parse_field(line: &str) -> Option<FieldOffset> {
    let mut cursor = Cursor::new(line);
    let method_table = cursor.hex_u64()?;
    let field_token = cursor.hex_u64()?;
    let offset = cursor.hex_u64()?;
    let field_type = cursor.token()?;
    let value_type = match cursor.dec_u64()? {
        0 => false,
        1 => true,
        _ => return None,
    };

    let (is_static, value, name) = match cursor.token()? {
        "instance" => (false, cursor.token()?, cursor.remainder()?),
        "static" | "TLstatic" | "CLstatic" => (true, cursor.token()?, cursor.remainder()?),
        // Per-domain values follow on `>>` continuation lines
        "shared" => {
            if !cursor.literal("static") {
                return None;
            }
            (true, "", cursor.remainder()?)
        }
        _ => return None,
    };

    Some(FieldOffset {
        method_table,
        field_token,
        offset,
        field_type: field_type.to_string(),
        value_type,
        is_static,
        value: value.to_string(),
        name: name.to_string(),
    })
}

/// Labeled line of `dumpclass`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassHeader {
    ClassName(String),
    ParentClass(u64),
}

pub fn parse_class_header(line: &str) -> Option<ClassHeader> {
    if let Some(name) = labeled(line, "Class Name") {
        return Some(ClassHeader::ClassName(name.to_string()));
    }
    labeled(line, "Parent Class")
        .and_then(parse_hex)
        .map(ClassHeader::ParentClass)
}

/// `Array: Rank 1, Number of elements 4, Type CLASS`, yielding the length
pub fn parse_array_length(line: &str) -> Option<u64> {
    let value = labeled(line, "Array")?;
    let (_, after) = value.split_once("Number of elements")?;
    let digits = after.trim_start().split([',', ' ']).next()?;
    parse_dec(digits)
}

/// `Element Methodtable: <mt>`
pub fn parse_element_method_table(line: &str) -> Option<u64> {
    labeled(line, "Element Methodtable")
        .or_else(|| labeled(line, "Element MethodTable"))
        .and_then(parse_hex)
}

/// `[index] address` or `[index] null`
pub fn parse_array_element(line: &str) -> Option<(u64, Option<u64>)> {
    let rest = line.trim_start().strip_prefix('[')?;
    let (index, value) = rest.split_once(']')?;
    let index = parse_dec(index)?;
    let mut cursor = Cursor::new(value);
    match cursor.token()? {
        "null" => Some((index, None)),
        token => parse_hex(token).map(|address| (index, Some(address))),
    }
}

/// `target method name` row of `dumpdelegate`
pub fn parse_delegate(line: &str) -> Option<DelegateMethodDetails> {
    let mut cursor = Cursor::new(line);
    let target = cursor.hex_u64()?;
    let method_desc = cursor.hex_u64()?;
    let method_name = cursor.remainder()?;
    Some(DelegateMethodDetails {
        target,
        method_desc,
        method_name: method_name.to_string(),
    })
}

/// `address methodtable size [state] description` row of `dumpasync`
pub fn parse_async_state_machine(line: &str) -> Option<AsyncStateMachineDetails> {
    let mut cursor = Cursor::new(line);
    let address = cursor.hex_u64()?;
    let method_table = cursor.hex_u64()?;
    let size_bytes = cursor.dec_u64()?;
    let state = cursor.dec_i64();
    let description = cursor.remainder()?;
    Some(AsyncStateMachineDetails {
        address,
        method_table,
        size_bytes,
        state,
        description: description.to_string(),
    })
}

//! Typed operations on a started [`ProtocolEngine`]
//!
//! Each operation sends the matching command for the engine's dialect, reads
//! the whole response and returns the records it recognised. Lines of any
//! other shape (headers, separators, totals) are skipped. A response is
//! always read to its end, even after the record of interest was found, so
//! the engine is free for the next command when the call returns.

use dumpscope_core::prelude::*;
use dumpscope_core::{
    AnalyzerStackFrame, ArrayDetails, AsyncStateMachineDetails, DelegateMethodDetails,
    EEClassDetails, GcHandleReport, GcHeapLayout, GcHeapStat, HeapEntry, HeapScope,
    MethodTableDetails, ObjectDetails, ThreadDetails, TypeStatistic,
};

use crate::command::{Command, STRING_CHARS_OFFSET, STRING_LENGTH_OFFSET};
use crate::engine::ProtocolEngine;
use crate::parsers::{
    self, decode_utf16_units, parse_array_element, parse_array_length, parse_class_header,
    parse_element_method_table, parse_field, parse_memory_line, parse_object_header,
    ClassHeader, HeapLine, ObjectHeader,
};

impl ProtocolEngine {
    /// Run `first` (and `second`) and hand every response line to `visit`
    async fn each_line(
        &self,
        first: Command,
        second: Option<Command>,
        mut visit: impl FnMut(&str),
    ) -> Result<()> {
        let mut response = self.send_command(first, second)?;
        while let Some(line) = response.next_line().await? {
            visit(&line.text());
        }
        Ok(())
    }

    async fn collect<T>(
        &self,
        command: Command,
        mut parse: impl FnMut(&str) -> Option<T>,
    ) -> Result<Vec<T>> {
        let mut records = Vec::new();
        self.each_line(command, None, |line| {
            if let Some(record) = parse(line) {
                records.push(record);
            }
        })
        .await?;
        Ok(records)
    }

    /// Objects from `dumpheap -live` or `-dead`; free blocks are dropped
    pub async fn heap_entries(&self, scope: HeapScope) -> Result<Vec<HeapEntry>> {
        let live = scope.is_live();
        let entries = self
            .collect(self.dialect().dump_heap(scope)?, |line| {
                match parsers::parse_heap_entry(line, live) {
                    Some(HeapLine::Object(entry)) => Some(entry),
                    _ => None,
                }
            })
            .await?;
        debug!(engine = %self.name(), count = entries.len(), ?scope, "Heap entries loaded");
        Ok(entries)
    }

    /// Per-type rows of `dumpheap -stat`, checked against its `Total N objects` line.
    ///
    /// A nonzero total with no recognisable rows is a [`Error::MissingRecord`];
    /// a total that disagrees with the row counts is only logged.
    pub async fn heap_statistics(&self) -> Result<Vec<TypeStatistic>> {
        let command = self.dialect().dump_heap_stat()?;
        let mut statistics = Vec::new();
        let mut total = None;
        self.each_line(command, None, |line| {
            if let Some(statistic) = parsers::parse_type_statistic(line) {
                statistics.push(statistic);
            } else if let Some(count) = parsers::parse_total_objects(line) {
                total = Some(count);
            }
        })
        .await?;

        if let Some(total) = total {
            let counted: u64 = statistics.iter().map(|s| s.count).sum();
            if statistics.is_empty() && total > 0 {
                return Err(Error::missing_record(command.to_string(), "type statistics"));
            }
            if counted != total {
                warn!(
                    engine = %self.name(),
                    total,
                    counted,
                    "Heap statistics rows disagree with the reported total"
                );
            }
        }
        Ok(statistics)
    }

    pub async fn threads(&self) -> Result<Vec<ThreadDetails>> {
        self.collect(self.dialect().threads()?, parsers::parse_thread)
            .await
    }

    /// Managed frames of the thread at `thread` (an index from [`threads`](Self::threads)).
    ///
    /// Selecting the thread and walking its stack share one exchange so no
    /// other command can change the selection in between.
    pub async fn stack_frames(&self, thread: u32) -> Result<Vec<AnalyzerStackFrame>> {
        let dialect = self.dialect();
        let mut frames = Vec::new();
        self.each_line(
            dialect.select_thread(thread)?,
            Some(dialect.clr_stack()?),
            |line| {
                if let Some(frame) = parsers::parse_stack_frame(line) {
                    frames.push(frame);
                }
            },
        )
        .await?;
        Ok(frames)
    }

    /// Header and fields of the object at `address`
    pub async fn dump_object(&self, address: u64) -> Result<ObjectDetails> {
        let command = self.dialect().dump_object(address)?;
        let mut details = ObjectDetails {
            address,
            ..ObjectDetails::default()
        };
        let mut found_type = false;

        self.each_line(command, None, |line| {
            if let Some(field) = parse_field(line) {
                details.fields.push(field);
                return;
            }
            match parse_object_header(line) {
                Some(ObjectHeader::Name(name)) => {
                    details.type_name = name;
                    found_type = true;
                }
                Some(ObjectHeader::MethodTable(mt)) => details.method_table = mt,
                Some(ObjectHeader::EEClass(ee_class)) => details.ee_class = ee_class,
                Some(ObjectHeader::Size(size)) => details.size_bytes = size,
                Some(ObjectHeader::StringPreview(_)) | None => {}
            }
        })
        .await?;

        if !found_type {
            return Err(Error::missing_record(command.to_string(), "object type name"));
        }
        Ok(details)
    }

    /// Character count of the `System.String` at `address`
    pub async fn string_length(&self, address: u64) -> Result<u32> {
        let command = self
            .dialect()
            .read_dword(address.wrapping_add(STRING_LENGTH_OFFSET))?;
        let mut length = None;
        self.each_line(command, None, |line| {
            if length.is_none() {
                length = parse_memory_line(line).and_then(|m| m.values.first().copied());
            }
        })
        .await?;

        length
            .and_then(|value| u32::try_from(value).ok())
            .ok_or_else(|| Error::missing_record(command.to_string(), "string length"))
    }

    /// `count` UTF-16 code units starting at `address`
    pub async fn read_chars(&self, address: u64, count: u32) -> Result<String> {
        if count == 0 {
            return Ok(String::new());
        }
        let wanted = count as usize;
        let mut units = Vec::with_capacity(wanted);
        self.each_line(
            self.dialect().read_words(address, u64::from(count))?,
            None,
            |line| {
                if let Some(memory) = parse_memory_line(line) {
                    units.extend(memory.values);
                }
            },
        )
        .await?;

        if units.len() < wanted {
            warn!(
                engine = %self.name(),
                wanted,
                read = units.len(),
                "Short character read at {:X}",
                address
            );
        }
        units.truncate(wanted);
        Ok(decode_utf16_units(&units))
    }

    /// Contents of the `System.String` at `address`, read from raw memory
    pub async fn string_value(&self, address: u64) -> Result<String> {
        let length = self.string_length(address).await?;
        self.read_chars(address.wrapping_add(STRING_CHARS_OFFSET), length)
            .await
    }

    /// The `String:` preview `do` prints for a string object, if any
    pub async fn string_preview(&self, address: u64) -> Result<Option<String>> {
        let mut preview = None;
        self.each_line(self.dialect().dump_object_short(address)?, None, |line| {
            if let Some(ObjectHeader::StringPreview(text)) = parse_object_header(line) {
                preview.get_or_insert(text);
            }
        })
        .await?;
        Ok(preview)
    }

    /// Target/method rows of the delegate at `address`; multicast delegates
    /// yield one row per invocation entry
    pub async fn delegate_details(&self, address: u64) -> Result<Vec<DelegateMethodDetails>> {
        self.collect(self.dialect().dump_delegate(address)?, parsers::parse_delegate)
            .await
    }

    pub async fn method_table_details(&self, method_table: u64) -> Result<MethodTableDetails> {
        let command = self.dialect().dump_method_table(method_table)?;
        let mut ee_class = None;
        let mut type_name = None;
        self.each_line(command, None, |line| match parse_object_header(line) {
            Some(ObjectHeader::EEClass(value)) => ee_class = Some(value),
            Some(ObjectHeader::Name(name)) => type_name = Some(name),
            _ => {}
        })
        .await?;

        let type_name =
            type_name.ok_or_else(|| Error::missing_record(command.to_string(), "type name"))?;
        let ee_class =
            ee_class.ok_or_else(|| Error::missing_record(command.to_string(), "EEClass"))?;
        Ok(MethodTableDetails {
            method_table,
            ee_class,
            type_name,
        })
    }

    pub async fn class_details(&self, ee_class: u64) -> Result<EEClassDetails> {
        let command = self.dialect().dump_class(ee_class)?;
        let mut class_name = None;
        let mut parent_ee_class = 0;
        self.each_line(command, None, |line| match parse_class_header(line) {
            Some(ClassHeader::ClassName(name)) => class_name = Some(name),
            Some(ClassHeader::ParentClass(parent)) => parent_ee_class = parent,
            None => {}
        })
        .await?;

        let class_name =
            class_name.ok_or_else(|| Error::missing_record(command.to_string(), "class name"))?;
        Ok(EEClassDetails {
            ee_class,
            class_name,
            parent_ee_class,
        })
    }

    pub async fn array_details(&self, address: u64) -> Result<ArrayDetails> {
        let command = self.dialect().dump_array(address)?;
        let mut method_table = 0;
        let mut element_method_table = None;
        let mut length = None;
        let mut elements = Vec::new();

        self.each_line(command, None, |line| {
            if let Some((_, element)) = parse_array_element(line) {
                elements.push(element);
            } else if let Some(value) = parse_array_length(line) {
                length = Some(value);
            } else if let Some(value) = parse_element_method_table(line) {
                element_method_table = Some(value);
            } else if let Some(ObjectHeader::MethodTable(value)) = parse_object_header(line) {
                method_table = value;
            }
        })
        .await?;

        let length =
            length.ok_or_else(|| Error::missing_record(command.to_string(), "array length"))?;
        Ok(ArrayDetails {
            address,
            method_table,
            element_method_table,
            length,
            elements,
        })
    }

    pub async fn async_state_machines(&self) -> Result<Vec<AsyncStateMachineDetails>> {
        self.collect(
            self.dialect().dump_async()?,
            parsers::parse_async_state_machine,
        )
        .await
    }

    /// Generation starts and segments from `eeheap -gc`
    pub async fn gc_heap_layout(&self) -> Result<GcHeapLayout> {
        let mut layout = GcHeapLayout::default();
        self.each_line(self.dialect().ee_heap_gc()?, None, |line| {
            if let Some(start) = parsers::parse_generation_start(line) {
                layout.generations.push(start);
            } else if let Some(segment) = parsers::parse_heap_segment(line) {
                layout.segments.push(segment);
            }
        })
        .await?;
        Ok(layout)
    }

    /// Handle rows and the trailing per-type statistics from `gchandles`
    pub async fn gc_handles(&self) -> Result<GcHandleReport> {
        let mut report = GcHandleReport::default();
        self.each_line(self.dialect().gc_handles()?, None, |line| {
            if let Some(handle) = parsers::parse_gc_handle(line) {
                report.handles.push(handle);
            } else if let Some(stat) = parsers::parse_type_statistic(line) {
                report.statistics.push(stat);
            }
        })
        .await?;
        Ok(report)
    }

    pub async fn gc_heap_stats(&self) -> Result<Vec<GcHeapStat>> {
        self.collect(self.dialect().gc_heap_stat()?, parsers::parse_gc_heap_stat)
            .await
    }

    /// `count` pointer-sized values starting at `address`
    pub async fn read_qwords(&self, address: u64, count: u32) -> Result<Vec<u64>> {
        let mut values = Vec::with_capacity(count as usize);
        self.each_line(
            self.dialect().read_qwords(address, u64::from(count))?,
            None,
            |line| {
                if let Some(memory) = parse_memory_line(line) {
                    values.extend(memory.values);
                }
            },
        )
        .await?;
        values.truncate(count as usize);
        Ok(values)
    }

    /// Send a user-supplied command line verbatim and return its output
    pub async fn execute_raw(&self, text: &str) -> Result<Vec<String>> {
        self.send(Command::raw(text)?)?.collect_strings().await
    }
}

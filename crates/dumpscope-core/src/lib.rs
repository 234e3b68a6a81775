//! # dumpscope-core - Core Types
//!
//! Foundation crate for dumpscope. Provides error handling, logging setup and
//! the typed records extracted from debugger output.
//!
//! This crate has **zero internal dependencies**.
//!
//! ## Public API
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Records (`records`)
//! - [`HeapEntry`], [`TypeStatistic`] - `dumpheap` rows
//! - [`ObjectDetails`], [`FieldOffset`] - `dumpobj` output
//! - [`AnalyzerStackFrame`], [`ThreadDetails`] - `clrstack` / `threads` rows
//! - [`GcHeapLayout`], [`GcHandleReport`], [`GcHeapStat`] - GC state
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use dumpscope_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod prelude;
pub mod records;

pub use error::{Error, Result, ResultExt};
pub use records::{
    AnalyzerStackFrame, ArrayDetails, AsyncStateMachineDetails, DelegateMethodDetails,
    EEClassDetails, FieldOffset, GcGenerationStart, GcHandle, GcHandleReport, GcHeapLayout,
    GcHeapStat, HeapEntry, HeapScope, HeapSegment, MethodTableDetails, ObjectDetails,
    ThreadDetails, TypeStatistic,
};

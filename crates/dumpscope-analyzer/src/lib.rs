//! # dumpscope-analyzer - Debugger Protocol Engine
//!
//! Drives a text-mode .NET debugger (`dotnet-dump analyze`, or WinDbg/cdb with
//! SOS) over a blocking byte stream: commands go in, lines come back, and the
//! lines are parsed into the typed records of [`dumpscope_core`].
//!
//! ## Public API
//!
//! ### Text pipeline (`text`)
//! - [`BufferPool`], [`PooledBuffer`], [`LineView`] - Ref-counted pooled text buffers and zero-copy line views
//! - [`RingByteBuffer`] - Fixed-capacity byte ring between the transport and the decoder
//! - [`LineSplitter`] - Incremental byte-to-line state machine
//! - [`Encoding`], [`Newline`] - Transport text conventions
//!
//! ### Protocol (`engine`, `channel`, `command`)
//! - [`ProtocolEngine`] - One backend, one dedicated I/O thread, one exchange at a time
//! - [`ResponseStream`] - Ordered async lines of one command's output
//! - [`Command`], [`Dialect`] - Fixed-capacity command text and per-debugger vocabulary
//!
//! ### Backends (`backend`)
//! - [`LocalProcess`] - `dotnet-dump analyze` child process
//! - [`connect_remote()`] - Callback-driven remote debugger session as a byte stream
//!
//! ### Parsing (`parsers`, `ops`)
//! - `parsers::*` - Pure line parsers, one per output shape
//! - Typed operations on [`ProtocolEngine`] (`heap_entries`, `threads`, `dump_object`, ...)

pub mod backend;
pub mod channel;
pub mod command;
pub mod engine;
pub mod ops;
pub mod parsers;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod text;

pub use backend::local::LocalOptions;
pub use backend::remote::RemoteOptions;
pub use backend::{
    connect_remote, Backend, BackendControl, DebugConnector, DebugSession, LocalProcess,
    OutputSink, RemoteStream, Transport,
};
pub use channel::{ResponseChannel, ResponseStream, ResponseWriter};
pub use command::{Command, Dialect, COMMAND_CAPACITY};
pub use engine::{EngineOptions, EngineState, ProtocolEngine, DEFAULT_PROMPT, DEFAULT_SENTINEL};
pub use text::{
    BufferPool, Encoding, LineSplitter, LineView, Newline, PooledBuffer, RingByteBuffer,
};

//! Debugger transports underneath the protocol engine
//!
//! A backend supplies a blocking duplex byte stream ([`Transport`]) and a
//! lifecycle handle ([`BackendControl`]). The engine never knows whether the
//! bytes come from a child process pipe or a remote debugger session.

pub mod local;
pub mod remote;

use std::io::{Read, Write};
use std::time::Duration;

use dumpscope_core::prelude::*;

use crate::command::Dialect;
use crate::text::{Encoding, Newline};

pub use local::LocalProcess;
pub use remote::{connect_remote, DebugConnector, DebugSession, OutputSink, RemoteStream};

/// Blocking byte stream pair plus its text conventions
pub struct Transport {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub encoding: Encoding,
    pub newline: Newline,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("encoding", &self.encoding)
            .field("newline", &self.newline)
            .finish()
    }
}

/// Lifecycle of whatever sits behind a [`Transport`]
pub trait BackendControl: Send {
    /// Non-blocking exit check
    fn has_exited(&mut self) -> bool;

    /// Wait up to `timeout` for a voluntary exit; `false` if still running
    fn wait_for_exit(&mut self, timeout: Duration) -> Result<bool>;

    /// Force termination
    fn kill(&mut self) -> Result<()>;

    /// Exit code once the backend has exited, if it reported one
    fn exit_code(&self) -> Option<i32> {
        None
    }

    /// Short human-readable description for logs
    fn describe(&self) -> String;
}

/// A backend ready to be handed to [`crate::ProtocolEngine::start`]
pub struct Backend {
    pub transport: Transport,
    pub control: Box<dyn BackendControl>,
    pub dialect: Dialect,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("transport", &self.transport)
            .field("control", &self.control.describe())
            .field("dialect", &self.dialect)
            .finish()
    }
}

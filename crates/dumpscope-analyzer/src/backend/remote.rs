//! Remote interactive debugger session exposed as a blocking stream
//!
//! Native debugger clients deliver command output through callbacks on their
//! own thread. [`RemoteStream`] turns that into the plain `Read`/`Write` pair
//! the engine expects:
//!
//! - bytes written by the engine are split into lines; each line is executed
//!   on a pump thread that owns the [`DebugSession`]
//! - output callbacks push text into a bounded buffer through an
//!   [`OutputSink`]; the engine's `read` blocks on a condition variable until
//!   text (or end of stream) is available
//! - after every command the pump appends the end-of-output sentinel, and one
//!   sentinel is emitted up front to terminate the (empty) banner

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use dumpscope_core::prelude::*;

use super::{Backend, BackendControl, Transport};
use crate::command::Dialect;
use crate::text::{Encoding, Newline};

/// Delay between connection attempts
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const INITIAL_BUFFER_BYTES: usize = 64 * 1024;

/// A connected native debugger client
pub trait DebugSession: Send {
    /// Execute one command, delivering all of its output to `sink` before
    /// returning
    fn execute(&mut self, command: &str, sink: &OutputSink) -> Result<()>;

    /// End the session; called once when the stream shuts down
    fn detach(&mut self) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String;
}

/// Establishes [`DebugSession`]s, e.g. to a `tcp:port=...,server=...` target
pub trait DebugConnector {
    fn connect(&self) -> Result<Box<dyn DebugSession>>;
}

/// Settings for [`connect_remote`]
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Overall budget for connecting and the readiness check
    pub connect_timeout: Duration,
    /// Bytes of callback output buffered before callbacks block
    pub stream_buffer_bytes: usize,
    pub sentinel: String,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            stream_buffer_bytes: 64 * 1024,
            sentinel: crate::engine::DEFAULT_SENTINEL.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rendezvous buffer
// ─────────────────────────────────────────────────────────────────────────────

struct BufferState {
    bytes: VecDeque<u8>,
    closed: bool,
}

struct StreamShared {
    state: Mutex<BufferState>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl StreamShared {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BufferState {
                bytes: VecDeque::with_capacity(capacity.min(INITIAL_BUFFER_BYTES)),
                closed: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity: capacity.max(1),
        })
    }

    fn close(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

/// Callback-side handle that feeds debugger output into a [`RemoteStream`]
#[derive(Clone)]
pub struct OutputSink {
    shared: Arc<StreamShared>,
}

impl OutputSink {
    /// A sink that never blocks, for output collected on the calling thread
    fn unbounded() -> Self {
        Self {
            shared: StreamShared::new(usize::MAX),
        }
    }

    /// Append output, blocking while the buffer is full.
    ///
    /// Output arriving after the stream closed is discarded.
    pub fn write(&self, mut data: &[u8]) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        while !data.is_empty() {
            while state.bytes.len() >= self.shared.capacity && !state.closed {
                state = self
                    .shared
                    .writable
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
            if state.closed {
                return;
            }
            let room = self.shared.capacity - state.bytes.len();
            let n = room.min(data.len());
            state.bytes.extend(&data[..n]);
            data = &data[n..];
            self.shared.readable.notify_one();
        }
    }

    pub fn write_str(&self, text: &str) {
        self.write(text.as_bytes());
    }

    pub fn write_line(&self, text: &str) {
        self.write(text.as_bytes());
        self.write(b"\n");
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .bytes
            .len()
    }

    fn take_all(&self) -> Vec<u8> {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let bytes: Vec<u8> = state.bytes.drain(..).collect();
        self.shared.writable.notify_all();
        bytes
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream halves
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for the stream halves over one session
pub struct RemoteStream;

impl RemoteStream {
    /// Start the pump thread for `session` and return the transport plus its
    /// lifecycle handle
    pub fn open(
        session: Box<dyn DebugSession>,
        sentinel: &str,
        buffer_bytes: usize,
    ) -> Result<(RemoteReader, RemoteWriter, RemoteControl)> {
        let shared = StreamShared::new(buffer_bytes);
        let sink = OutputSink {
            shared: Arc::clone(&shared),
        };
        let (command_tx, command_rx) = mpsc::channel::<String>();
        let finished = Arc::new(AtomicBool::new(false));
        let description = session.describe();

        let pump = Pump {
            session,
            commands: command_rx,
            sink,
            sentinel: sentinel.to_string(),
            finished: Arc::clone(&finished),
        };
        thread::Builder::new()
            .name("remote-debugger-pump".to_string())
            .spawn(move || pump.run())?;

        Ok((
            RemoteReader {
                shared: Arc::clone(&shared),
            },
            RemoteWriter {
                commands: command_tx,
                partial: Vec::new(),
            },
            RemoteControl {
                shared,
                finished,
                description,
            },
        ))
    }
}

/// Engine-side `Read` half
pub struct RemoteReader {
    shared: Arc<StreamShared>,
}

impl Read for RemoteReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        while state.bytes.is_empty() && !state.closed {
            state = self
                .shared
                .readable
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        let n = buf.len().min(state.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(state.bytes.drain(..n)) {
            *slot = byte;
        }
        self.shared.writable.notify_all();
        Ok(n)
    }
}

/// Engine-side `Write` half: complete lines become session commands
pub struct RemoteWriter {
    commands: mpsc::Sender<String>,
    partial: Vec<u8>,
}

impl Write for RemoteWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        for &byte in data {
            if byte != b'\n' {
                self.partial.push(byte);
                continue;
            }
            if self.partial.last() == Some(&b'\r') {
                self.partial.pop();
            }
            let line = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.commands.send(line).map_err(|_| {
                io::Error::new(io::ErrorKind::BrokenPipe, "remote session has ended")
            })?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Pump {
    session: Box<dyn DebugSession>,
    commands: mpsc::Receiver<String>,
    sink: OutputSink,
    sentinel: String,
    finished: Arc<AtomicBool>,
}

impl Pump {
    fn run(mut self) {
        info!("Remote debugger pump started: {}", self.session.describe());
        self.sink.write_line(&self.sentinel);

        while let Ok(command) = self.commands.recv() {
            debug!("Remote execute: {}", command);
            if let Err(e) = self.session.execute(&command, &self.sink) {
                error!("Remote command '{}' failed: {}", command, e);
                break;
            }
            self.sink.write_line(&self.sentinel);
            if is_exit_command(&command) {
                debug!("Remote session received '{}', stopping pump", command);
                break;
            }
        }

        if let Err(e) = self.session.detach() {
            warn!("Failed to detach remote debugger session: {}", e);
        }
        self.sink.shared.close();
        self.finished.store(true, Ordering::Release);
        info!("Remote debugger pump stopped");
    }
}

fn is_exit_command(command: &str) -> bool {
    matches!(command.trim(), "exit" | "q" | "qd")
}

/// Lifecycle handle over the pump thread
pub struct RemoteControl {
    shared: Arc<StreamShared>,
    finished: Arc<AtomicBool>,
    description: String,
}

impl BackendControl for RemoteControl {
    fn has_exited(&mut self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while !self.has_exited() {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        Ok(true)
    }

    fn kill(&mut self) -> Result<()> {
        // The pump may be inside a native call; closing unblocks both sides
        // and discards any further output.
        self.shared.close();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("remote {}", self.description)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// Connect through `connector`, retrying until `connect_timeout`, and confirm
/// the session answers an `.echo` before handing it to an engine.
pub fn connect_remote(connector: &dyn DebugConnector, options: &RemoteOptions) -> Result<Backend> {
    let started = Instant::now();
    let timed_out = || Error::StartupTimeout {
        elapsed: started.elapsed(),
    };

    let mut attempt = 0u32;
    let mut session = loop {
        attempt += 1;
        match connector.connect() {
            Ok(session) => break session,
            Err(e) if started.elapsed() < options.connect_timeout => {
                warn!("Remote connect attempt {} failed: {}", attempt, e);
                thread::sleep(CONNECT_RETRY_INTERVAL);
            }
            Err(e) => {
                error!("Giving up on remote debugger after {} attempts: {}", attempt, e);
                return Err(timed_out());
            }
        }
    };
    info!(
        "Connected to remote debugger {} after {} attempt(s)",
        session.describe(),
        attempt
    );

    // Nothing drains this sink while `execute` runs, so it must not block.
    let marker = format!("dumpscope-ready-{}", std::process::id());
    let echo_sink = OutputSink::unbounded();
    loop {
        session.execute(&format!(".echo {}", marker), &echo_sink)?;
        let output = echo_sink.take_all();
        if String::from_utf8_lossy(&output).contains(&marker) {
            break;
        }
        if started.elapsed() >= options.connect_timeout {
            let _ = session.detach();
            return Err(timed_out());
        }
        thread::sleep(CONNECT_RETRY_INTERVAL);
    }

    let (reader, writer, control) =
        RemoteStream::open(session, &options.sentinel, options.stream_buffer_bytes)?;
    Ok(Backend {
        transport: Transport {
            reader: Box::new(reader),
            writer: Box::new(writer),
            encoding: Encoding::Utf8,
            newline: Newline::LF,
        },
        control: Box::new(control),
        dialect: Dialect::WinDbg,
    })
}

//! Test utilities: an in-memory scripted debugger backend
//!
//! [`ScriptedBackend`] answers each command line the engine writes with a
//! reply computed by a closure, framed the way `dotnet-dump analyze` frames
//! its output (prompt echo, data lines, end-of-output sentinel). Reads can be
//! chunked down to a single byte to exercise buffer boundaries.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dumpscope_core::prelude::*;

use crate::backend::{Backend, BackendControl, Transport};
use crate::command::Dialect;
use crate::engine::DEFAULT_SENTINEL;
use crate::text::{Encoding, Newline};

/// How the scripted debugger answers one command
#[derive(Debug, Clone)]
pub enum ScriptReply {
    /// Data lines; prompt echo and sentinel are added around them
    Lines(Vec<String>),
    /// Bytes written verbatim, framing included
    Raw(Vec<u8>),
    /// Close the output stream as if the process exited
    Exit,
}

impl ScriptReply {
    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptReply::Lines(lines.into_iter().map(Into::into).collect())
    }

    /// Answer a `dw` command over `words` mapped at `base`.
    ///
    /// Follows SOS: `-c` is the total number of words printed, `-w` the number
    /// per row (default 8). Words past the end of `words` are not printed.
    /// Anything that is not a readable `dw` yields no lines.
    pub fn memory_words(command: &str, base: u64, words: &[u16]) -> Self {
        ScriptReply::Lines(dump_words(command, base, words).unwrap_or_default())
    }
}

fn dump_words(command: &str, base: u64, words: &[u16]) -> Option<Vec<String>> {
    let mut tokens = command.split_whitespace();
    if tokens.next()? != "dw" {
        return None;
    }
    let (mut count, mut width, mut address) = (1usize, 8usize, None);
    while let Some(token) = tokens.next() {
        match token {
            "-c" => count = tokens.next()?.parse().ok()?,
            "-w" => width = tokens.next()?.parse().ok()?,
            other => address = u64::from_str_radix(other, 16).ok(),
        }
    }
    let address = address?;
    let start = usize::try_from(address.checked_sub(base)? / 2).ok()?;
    let end = start.saturating_add(count).min(words.len());
    let rows = words
        .get(start..end)?
        .chunks(width.max(1))
        .enumerate()
        .map(|(row, chunk)| {
            let values: Vec<String> = chunk.iter().map(|w| format!("{:04x}", w)).collect();
            let row_address = address + (row * width * 2) as u64;
            format!("{:016x}:  {}", row_address, values.join(" "))
        })
        .collect();
    Some(rows)
}

type Handler = Box<dyn FnMut(&str) -> ScriptReply + Send>;

/// Builder for a scripted backend
pub struct ScriptedBackend {
    handler: Handler,
    banner: Vec<String>,
    banner_sentinel: bool,
    echo_prompt: bool,
    max_read: usize,
    dialect: Dialect,
}

impl ScriptedBackend {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&str) -> ScriptReply + Send + 'static,
    {
        Self {
            handler: Box::new(handler),
            banner: vec!["Loading core dump: test.dmp ...".to_string()],
            banner_sentinel: true,
            echo_prompt: true,
            max_read: usize::MAX,
            dialect: Dialect::DotnetDump,
        }
    }

    pub fn with_banner<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.banner = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Never terminate the banner, so startup can only fail or hang
    pub fn without_banner_sentinel(mut self) -> Self {
        self.banner_sentinel = false;
        self
    }

    /// Cap every `read` at `max` bytes
    pub fn with_max_read(mut self, max: usize) -> Self {
        self.max_read = max.max(1);
        self
    }

    pub fn without_prompt(mut self) -> Self {
        self.echo_prompt = false;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn build(self) -> (Backend, ScriptHandle) {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();

        let mut banner = String::new();
        for line in &self.banner {
            banner.push_str(line);
            banner.push('\n');
        }
        if self.banner_sentinel {
            banner.push_str(DEFAULT_SENTINEL);
            banner.push('\n');
        }
        if !banner.is_empty() {
            let _ = tx.send(banner.into_bytes());
        }

        let state = Arc::new(ScriptState {
            output: Mutex::new(Some(tx)),
            received: Mutex::new(Vec::new()),
            exited: AtomicBool::new(false),
            killed: AtomicBool::new(false),
        });

        let backend = Backend {
            transport: Transport {
                reader: Box::new(ChannelReader {
                    rx,
                    pending: Vec::new(),
                    pos: 0,
                    max_read: self.max_read,
                }),
                writer: Box::new(ScriptWriter {
                    state: Arc::clone(&state),
                    handler: self.handler,
                    partial: Vec::new(),
                    echo_prompt: self.echo_prompt,
                }),
                encoding: Encoding::Utf8,
                newline: Newline::LF,
            },
            control: Box::new(ScriptControl {
                state: Arc::clone(&state),
            }),
            dialect: self.dialect,
        };

        (backend, ScriptHandle { state })
    }
}

struct ScriptState {
    output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    received: Mutex<Vec<String>>,
    exited: AtomicBool,
    killed: AtomicBool,
}

impl ScriptState {
    fn close(&self) {
        self.output.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.exited.store(true, Ordering::Release);
    }
}

/// Test-side view of a scripted backend
#[derive(Clone)]
pub struct ScriptHandle {
    state: Arc<ScriptState>,
}

impl ScriptHandle {
    /// Command lines received so far
    pub fn received(&self) -> Vec<String> {
        self.state
            .received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn has_exited(&self) -> bool {
        self.state.exited.load(Ordering::Acquire)
    }

    pub fn was_killed(&self) -> bool {
        self.state.killed.load(Ordering::Acquire)
    }

    /// End the output stream now
    pub fn close_output(&self) {
        self.state.close();
    }
}

struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
    max_read: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf
            .len()
            .min(self.max_read)
            .min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct ScriptWriter {
    state: Arc<ScriptState>,
    handler: Handler,
    partial: Vec<u8>,
    echo_prompt: bool,
}

impl ScriptWriter {
    fn answer(&mut self, command: String) -> io::Result<()> {
        if self.has_exited() {
            return Err(broken_pipe());
        }
        self.state
            .received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.clone());

        let bytes = match (self.handler)(&command) {
            ScriptReply::Exit => {
                self.state.close();
                return Ok(());
            }
            ScriptReply::Raw(bytes) => bytes,
            ScriptReply::Lines(lines) => {
                let mut text = String::new();
                if self.echo_prompt {
                    text.push_str("> ");
                    text.push_str(&command);
                    text.push('\n');
                }
                for line in lines {
                    text.push_str(&line);
                    text.push('\n');
                }
                text.push_str(DEFAULT_SENTINEL);
                text.push('\n');
                text.into_bytes()
            }
        };

        let output = self.state.output.lock().unwrap_or_else(|e| e.into_inner());
        match output.as_ref() {
            Some(tx) if tx.send(bytes).is_ok() => Ok(()),
            _ => Err(broken_pipe()),
        }
    }

    fn has_exited(&self) -> bool {
        self.state.exited.load(Ordering::Acquire)
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "scripted debugger has exited")
}

impl Write for ScriptWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        for &byte in data {
            if byte != b'\n' {
                self.partial.push(byte);
                continue;
            }
            if self.partial.last() == Some(&b'\r') {
                self.partial.pop();
            }
            let command = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.answer(command)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ScriptControl {
    state: Arc<ScriptState>,
}

impl BackendControl for ScriptControl {
    fn has_exited(&mut self) -> bool {
        self.state.exited.load(Ordering::Acquire)
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        while !self.has_exited() {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(true)
    }

    fn kill(&mut self) -> Result<()> {
        self.state.killed.store(true, Ordering::Release);
        self.state.close();
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted debugger".to_string()
    }
}

//! Command/response protocol engine
//!
//! One [`ProtocolEngine`] drives one debugger backend. All blocking I/O runs on
//! a dedicated OS thread that owns the backend's streams; async callers talk to
//! it through a capacity-1 request channel and get each response back as a
//! [`ResponseStream`].
//!
//! ## Lifecycle
//!
//! ```text
//! Unstarted ─start─► AwaitingBanner ─sentinel─► Idle ⇄ Executing
//!                                                │
//!                                 shutdown ──────┴─► ShuttingDown ─► Disposed
//! ```
//!
//! Any transport failure moves the engine to `Faulted`; the debugger's session
//! state (selected thread, loaded modules) cannot be resumed, so there is no
//! automatic restart.
//!
//! ## Exchange protocol
//!
//! For each command the worker writes the line, then pulls lines from the
//! [`LineSplitter`] until the end-of-output sentinel. The prompt echo (`"> "`)
//! is dropped when it is the first line after the write; every other line is
//! forwarded in order. At most one exchange is outstanding: a second
//! [`ProtocolEngine::send_command`] before the first response is complete is
//! rejected with [`Error::ExchangeInFlight`].

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use dumpscope_core::prelude::*;

use crate::backend::{Backend, BackendControl, Transport};
use crate::channel::{ResponseChannel, ResponseStream, ResponseWriter};
use crate::command::{Command, Dialect};
use crate::text::{BufferPool, Encoding, LineSplitter, LineView, Newline};

/// Line every backend prints after a command's output
pub const DEFAULT_SENTINEL: &str = "<END_COMMAND_OUTPUT>";

/// Prompt echo preceding a command's output
pub const DEFAULT_PROMPT: &str = "> ";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Tuning for one engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Used for the worker thread name and in logs
    pub name: String,
    pub sentinel: String,
    pub prompt: String,
    pub ring_buffer_bytes: usize,
    pub text_buffer_bytes: usize,
    /// How long `shutdown` waits for a voluntary exit before killing
    pub shutdown_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            name: "engine".to_string(),
            sentinel: DEFAULT_SENTINEL.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            ring_buffer_bytes: 4096,
            text_buffer_bytes: 16 * 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Unstarted,
    AwaitingBanner,
    Idle,
    Executing,
    ShuttingDown,
    Disposed,
    Faulted,
}

/// One request: up to two command lines answered through one channel
struct Exchange {
    first: Command,
    second: Option<Command>,
    response: ResponseWriter,
    /// The backend is expected to close its output instead of sending the sentinel
    ends_with_eof: bool,
}

/// State shared between the engine handle and its worker thread
struct EngineShared {
    state: Mutex<EngineState>,
    busy: AtomicBool,
    commands_executed: AtomicU64,
}

impl EngineShared {
    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle on one debugger backend and its protocol thread
pub struct ProtocolEngine {
    options: EngineOptions,
    dialect: Dialect,
    shared: Arc<EngineShared>,
    control: Mutex<Box<dyn BackendControl>>,
    /// Taken by `start`
    transport: Mutex<Option<Transport>>,
    pool: BufferPool,
    requests: Option<SyncSender<Option<Exchange>>>,
    worker: Option<JoinHandle<()>>,
}

impl ProtocolEngine {
    /// Bind an engine to `backend` without starting it
    pub fn new(backend: Backend, options: EngineOptions) -> Self {
        let pool = BufferPool::new(options.text_buffer_bytes);
        Self::with_pool(backend, options, pool)
    }

    /// Like [`new`](Self::new) but drawing text buffers from a shared pool
    pub fn with_pool(backend: Backend, options: EngineOptions, pool: BufferPool) -> Self {
        Self {
            options,
            dialect: backend.dialect,
            shared: Arc::new(EngineShared {
                state: Mutex::new(EngineState::Unstarted),
                busy: AtomicBool::new(false),
                commands_executed: AtomicU64::new(0),
            }),
            control: Mutex::new(backend.control),
            transport: Mutex::new(Some(backend.transport)),
            pool,
            requests: None,
            worker: None,
        }
    }

    /// Create and start in one step
    pub async fn launch(backend: Backend, options: EngineOptions) -> Result<Self> {
        let mut engine = Self::new(backend, options);
        engine.start().await?;
        Ok(engine)
    }

    /// Spawn the protocol thread and wait until the backend's startup banner
    /// has been drained.
    ///
    /// No timeout is applied here; wrap the call if the backend may hang.
    pub async fn start(&mut self) -> Result<()> {
        let transport = self
            .transport
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(transport) = transport else {
            return Err(Error::AlreadyStarted {
                engine: self.options.name.clone(),
            });
        };

        let (request_tx, request_rx) = mpsc::sync_channel::<Option<Exchange>>(1);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let worker = Worker::new(transport, &self.options, self.pool.clone(), Arc::clone(&self.shared));
        self.shared.set_state(EngineState::AwaitingBanner);

        let handle = thread::Builder::new()
            .name(format!("dumpscope-{}", self.options.name))
            .spawn(move || worker.run(request_rx, ready_tx))?;
        self.worker = Some(handle);
        self.requests = Some(request_tx);

        info!(engine = %self.options.name, "Waiting for debugger banner");
        let ready = ready_rx
            .await
            .unwrap_or_else(|_| Err(Error::startup("protocol thread exited before ready")));

        match ready {
            Ok(()) => {
                self.shared.set_state(EngineState::Idle);
                info!(
                    engine = %self.options.name,
                    backend = %self.backend_description(),
                    "Debugger ready"
                );
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(EngineState::Faulted);
                error!(engine = %self.options.name, "Debugger failed to start: {}", e);
                Err(match e {
                    Error::StartupFailed { .. } => e,
                    other => Error::startup(other.to_string()),
                })
            }
        }
    }

    /// Issue one command (optionally followed by a second on the same
    /// response) and return its response lines.
    ///
    /// Returns immediately; lines arrive as the backend produces them.
    pub fn send_command(&self, first: Command, second: Option<Command>) -> Result<ResponseStream> {
        self.submit(first, second, false)
    }

    fn submit(
        &self,
        first: Command,
        second: Option<Command>,
        ends_with_eof: bool,
    ) -> Result<ResponseStream> {
        let Some(requests) = self.requests.as_ref() else {
            return Err(Error::protocol(format!(
                "engine '{}' has not been started",
                self.options.name
            )));
        };
        match self.shared.state() {
            EngineState::Faulted | EngineState::Disposed => return Err(self.closed_error()),
            _ => {}
        }

        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ExchangeInFlight {
                engine: self.options.name.clone(),
            });
        }

        let (response, stream) = ResponseChannel::open();
        debug!(engine = %self.options.name, "Sending command: {}", first);
        let exchange = Exchange {
            first,
            second,
            response,
            ends_with_eof,
        };

        match requests.try_send(Some(exchange)) {
            Ok(()) => Ok(stream),
            Err(TrySendError::Full(rejected)) => {
                self.shared.busy.store(false, Ordering::Release);
                if let Some(exchange) = rejected {
                    exchange.response.complete();
                }
                Err(Error::ExchangeInFlight {
                    engine: self.options.name.clone(),
                })
            }
            Err(TrySendError::Disconnected(rejected)) => {
                self.shared.busy.store(false, Ordering::Release);
                if let Some(exchange) = rejected {
                    exchange.response.fail(Error::BackendClosed);
                }
                Err(Error::BackendClosed)
            }
        }
    }

    /// Single-command shorthand for [`send_command`](Self::send_command)
    pub fn send(&self, command: Command) -> Result<ResponseStream> {
        self.send_command(command, None)
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// An exchange is outstanding
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Command lines completed so far, for progress reporting
    pub fn commands_executed(&self) -> u64 {
        self.shared.commands_executed.load(Ordering::Relaxed)
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn backend_description(&self) -> String {
        self.control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .describe()
    }

    /// Stop the backend and the protocol thread.
    ///
    /// Sends `exit` while the backend is alive, waits up to the configured
    /// timeout for it to quit and kills it after that.
    pub async fn shutdown(mut self) -> Result<()> {
        let name = self.options.name.clone();
        let started = self.requests.is_some();
        let faulted = self.state() == EngineState::Faulted;
        self.shared.set_state(EngineState::ShuttingDown);
        info!(engine = %name, "Shutting down debugger");

        let alive = !self.lock_control().has_exited();
        if alive && started && !faulted && !self.is_busy() {
            match self.send_exit() {
                Ok(mut response) => {
                    if let Err(e) = response.drain().await {
                        debug!(engine = %name, "Exit response ended with: {}", e);
                    }
                }
                Err(e) => debug!(engine = %name, "Could not send exit: {}", e),
            }
        }

        if alive {
            let deadline = Instant::now() + self.options.shutdown_timeout;
            loop {
                if self.lock_control().has_exited() {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(engine = %name, "Debugger did not exit in time, killing");
                    if let Err(e) = self.lock_control().kill() {
                        error!(engine = %name, "Failed to kill debugger: {}", e);
                    }
                    break;
                }
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        }

        if let Some(requests) = self.requests.take() {
            let _ = requests.try_send(None);
        }
        if let Some(handle) = self.worker.take() {
            let joined = tokio::task::spawn_blocking(move || handle.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!(engine = %name, "Protocol thread ended abnormally");
            }
        }

        self.shared.set_state(EngineState::Disposed);
        info!(
            engine = %name,
            commands = self.commands_executed(),
            "Debugger shut down"
        );
        Ok(())
    }

    /// Ask the backend to quit; end of output completes the response normally
    fn send_exit(&self) -> Result<ResponseStream> {
        self.submit(self.dialect.exit()?, None, true)
    }

    /// Why no further commands can run
    fn closed_error(&self) -> Error {
        let mut control = self.lock_control();
        if control.has_exited() {
            Error::BackendExited {
                code: control.exit_code(),
            }
        } else {
            Error::BackendClosed
        }
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, Box<dyn BackendControl>> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        warn!(
            engine = %self.options.name,
            "Engine dropped without shutdown, killing debugger"
        );
        if let Some(requests) = self.requests.take() {
            let _ = requests.try_send(None);
        }
        if let Err(e) = self.lock_control().kill() {
            error!(engine = %self.options.name, "Failed to kill debugger: {}", e);
        }
        // The worker sees end of stream or the stop request and exits on its own.
        self.worker.take();
        self.shared.set_state(EngineState::Disposed);
    }
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("name", &self.options.name)
            .field("dialect", &self.dialect)
            .field("state", &self.state())
            .field("commands_executed", &self.commands_executed())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Protocol thread
// ─────────────────────────────────────────────────────────────────────────────

struct Worker {
    name: String,
    lines: LineSplitter<Box<dyn Read + Send>>,
    input: Box<dyn Write + Send>,
    encoding: Encoding,
    newline: Newline,
    sentinel: String,
    prompt: String,
    shared: Arc<EngineShared>,
}

impl Worker {
    fn new(
        transport: Transport,
        options: &EngineOptions,
        pool: BufferPool,
        shared: Arc<EngineShared>,
    ) -> Self {
        let Transport {
            reader,
            writer,
            encoding,
            newline,
        } = transport;
        Self {
            name: options.name.clone(),
            lines: LineSplitter::new(
                reader,
                encoding.decoder(),
                newline,
                pool,
                options.ring_buffer_bytes,
            ),
            input: writer,
            encoding,
            newline,
            sentinel: options.sentinel.clone(),
            prompt: options.prompt.clone(),
            shared,
        }
    }

    fn run(mut self, requests: Receiver<Option<Exchange>>, ready: oneshot::Sender<Result<()>>) {
        let banner = self.drain_banner();
        let started = banner.is_ok();
        let _ = ready.send(banner);
        if !started {
            return;
        }

        while let Ok(Some(exchange)) = requests.recv() {
            let previous = self.shared.state();
            self.shared.set_state(EngineState::Executing);
            let Exchange {
                first,
                second,
                response,
                ends_with_eof,
            } = exchange;

            let mut result = self.run_command(&first, &response);
            if let (Ok(()), Some(second)) = (&result, second.as_ref()) {
                result = self.run_command(second, &response);
            }

            match result {
                Err(Error::BackendClosed) if ends_with_eof => {
                    self.shared.set_state(previous);
                    self.shared.busy.store(false, Ordering::Release);
                    debug!(engine = %self.name, "Backend closed its output after {}", first);
                    response.complete();
                }
                Ok(()) => {
                    self.shared.set_state(EngineState::Idle);
                    // Release the slot before the end marker so a caller that
                    // has seen the end can issue the next command at once.
                    self.shared.busy.store(false, Ordering::Release);
                    debug!(engine = %self.name, "Exchange complete: {}", first);
                    response.complete();
                }
                Err(e) => {
                    error!(engine = %self.name, "Command '{}' failed: {}", first, e);
                    self.shared.set_state(EngineState::Faulted);
                    self.shared.busy.store(false, Ordering::Release);
                    response.fail(e);
                }
            }
        }
        debug!(engine = %self.name, "Protocol thread stopping");
    }

    fn drain_banner(&mut self) -> Result<()> {
        let mut lines = 0usize;
        loop {
            match self.lines.next_line()? {
                Some(line) if self.is_sentinel(&line) => {
                    debug!(engine = %self.name, lines, "Banner drained");
                    return Ok(());
                }
                Some(line) => {
                    lines += 1;
                    debug!(engine = %self.name, "banner: {}", line);
                }
                None => {
                    return Err(Error::startup(format!(
                        "debugger output ended after {} banner lines without {}",
                        lines, self.sentinel
                    )))
                }
            }
        }
    }

    fn run_command(&mut self, command: &Command, response: &ResponseWriter) -> Result<()> {
        command.write_to(&mut self.input, self.encoding, self.newline)?;

        let mut first_line = true;
        loop {
            let Some(line) = self.lines.next_line()? else {
                return Err(Error::BackendClosed);
            };
            if self.is_sentinel(&line) {
                self.shared.commands_executed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            if first_line && line.starts_with(&self.prompt) {
                first_line = false;
                trace!(engine = %self.name, "skipping prompt: {}", line);
                continue;
            }
            first_line = false;
            trace!(engine = %self.name, "{}", line);
            response.append(line);
        }
    }

    fn is_sentinel(&self, line: &LineView) -> bool {
        line.starts_with(&self.sentinel) && line.text().trim_end() == self.sentinel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptReply, ScriptedBackend};

    fn options(name: &str) -> EngineOptions {
        EngineOptions {
            shutdown_timeout: Duration::from_millis(500),
            ring_buffer_bytes: 16,
            text_buffer_bytes: 64,
            ..EngineOptions::named(name)
        }
    }

    fn echo_script() -> ScriptedBackend {
        ScriptedBackend::new(|command| match command {
            "exit" => ScriptReply::Exit,
            other => ScriptReply::lines([format!("ran {}", other)]),
        })
    }

    #[tokio::test]
    async fn test_start_drains_banner() {
        let script = echo_script().with_banner(["Loading core dump: app.dmp ...", "Ready to process analysis commands."]);
        let (backend, _handle) = script.build();
        let mut engine = ProtocolEngine::new(backend, options("banner"));
        assert_eq!(engine.state(), EngineState::Unstarted);

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_prompt_and_sentinel_are_filtered() {
        let script = ScriptedBackend::new(|_| {
            ScriptReply::Raw(b"> \n<data line>\n<END_COMMAND_OUTPUT>\n".to_vec())
        });
        let (backend, _handle) = script.build();
        let engine = ProtocolEngine::launch(backend, options("filter")).await.unwrap();

        let lines = engine
            .send(Command::new("threads").unwrap())
            .unwrap()
            .collect_strings()
            .await
            .unwrap();
        assert_eq!(lines, vec!["<data line>"]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_prompt_only_skipped_as_first_line() {
        let script = ScriptedBackend::new(|_| {
            ScriptReply::Raw(b"> threads\ndata\n> not a prompt\n<END_COMMAND_OUTPUT>\n".to_vec())
        });
        let (backend, _handle) = script.build();
        let engine = ProtocolEngine::launch(backend, options("prompt")).await.unwrap();

        let lines = engine
            .send(Command::new("threads").unwrap())
            .unwrap()
            .collect_strings()
            .await
            .unwrap();
        assert_eq!(lines, vec!["data", "> not a prompt"]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_command_while_in_flight_is_rejected() {
        let (backend, _handle) = echo_script().build();
        let engine = ProtocolEngine::launch(backend, options("inflight")).await.unwrap();

        let mut first = engine.send(Command::new("threads").unwrap()).unwrap();
        let err = engine.send(Command::new("clrstack").unwrap()).unwrap_err();
        assert!(matches!(err, Error::ExchangeInFlight { ref engine } if engine == "inflight"));
        assert!(err.is_recoverable());

        assert_eq!(first.drain().await.unwrap(), 1);
        let second = engine.send(Command::new("clrstack").unwrap()).unwrap();
        assert_eq!(second.collect_strings().await.unwrap(), vec!["ran clrstack"]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_command_exchange_shares_one_response() {
        let (backend, handle) = echo_script().build();
        let engine = ProtocolEngine::launch(backend, options("pair")).await.unwrap();

        let lines = engine
            .send_command(
                Command::new("setthread 2").unwrap(),
                Some(Command::new("clrstack").unwrap()),
            )
            .unwrap()
            .collect_strings()
            .await
            .unwrap();
        assert_eq!(lines, vec!["ran setthread 2", "ran clrstack"]);
        assert_eq!(engine.commands_executed(), 2);
        assert_eq!(handle.received(), vec!["setthread 2", "clrstack"]);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_byte_reads_and_tiny_buffers() {
        let script = ScriptedBackend::new(|command| {
            ScriptReply::lines((0..20).map(|i| format!("{} row {} with some padding text", command, i)))
        })
        .with_max_read(1);
        let (backend, _handle) = script.build();
        let engine = ProtocolEngine::launch(
            backend,
            EngineOptions {
                ring_buffer_bytes: 3,
                text_buffer_bytes: 16,
                ..options("tiny")
            },
        )
        .await
        .unwrap();

        let lines = engine
            .send(Command::new("dumpheap -stat").unwrap())
            .unwrap()
            .collect_strings()
            .await
            .unwrap();
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[19], "dumpheap -stat row 19 with some padding text");
        assert_eq!(engine.buffer_pool().outstanding(), 1, "only the splitter's buffer");
        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_engines_keep_per_engine_order() {
        let mut tasks = Vec::new();
        for id in 0..4 {
            tasks.push(tokio::spawn(async move {
                let (backend, _handle) = ScriptedBackend::new(move |command| {
                    ScriptReply::lines((0..50).map(|i| format!("{} {} {}", id, command, i)))
                })
                .with_max_read(7)
                .build();
                let engine = ProtocolEngine::launch(backend, options(&format!("par-{}", id)))
                    .await
                    .unwrap();

                let mut seen = Vec::new();
                for command in ["A", "B"] {
                    let lines = engine
                        .send(Command::new(command).unwrap())
                        .unwrap()
                        .collect_strings()
                        .await
                        .unwrap();
                    seen.extend(lines);
                }
                engine.shutdown().await.unwrap();
                (id, seen)
            }));
        }

        for task in tasks {
            let (id, seen) = task.await.unwrap();
            assert_eq!(seen.len(), 100);
            for (i, line) in seen.iter().enumerate() {
                let command = if i < 50 { "A" } else { "B" };
                assert_eq!(line, &format!("{} {} {}", id, command, i % 50));
            }
        }
    }

    #[tokio::test]
    async fn test_backend_exit_mid_command_faults_engine() {
        let script = ScriptedBackend::new(|command| match command {
            "crash" => ScriptReply::Exit,
            other => ScriptReply::lines([other.to_string()]),
        });
        let (backend, _handle) = script.build();
        let engine = ProtocolEngine::launch(backend, options("crash")).await.unwrap();

        let mut response = engine.send(Command::new("crash").unwrap()).unwrap();
        let err = response.drain().await.unwrap_err();
        assert!(matches!(err, Error::BackendClosed));
        assert!(err.is_fatal());
        assert_eq!(engine.state(), EngineState::Faulted);
        assert!(matches!(
            engine.send(Command::new("threads").unwrap()),
            Err(Error::BackendExited { code: None })
        ));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_fails_without_sentinel() {
        let (backend, handle) = echo_script().without_banner_sentinel().build();
        handle.close_output();
        let mut engine = ProtocolEngine::new(backend, options("nostart"));
        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, Error::StartupFailed { .. }));
        assert_eq!(engine.state(), EngineState::Faulted);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let (backend, _handle) = echo_script().build();
        let mut engine = ProtocolEngine::new(backend, options("twice"));
        engine.start().await.unwrap();
        assert!(matches!(
            engine.start().await,
            Err(Error::AlreadyStarted { .. })
        ));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_before_start_is_rejected() {
        let (backend, _handle) = echo_script().build();
        let engine = ProtocolEngine::new(backend, options("cold"));
        assert!(matches!(
            engine.send(Command::new("threads").unwrap()),
            Err(Error::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_sends_exit() {
        let (backend, handle) = echo_script().build();
        let engine = ProtocolEngine::launch(backend, options("bye")).await.unwrap();
        engine.shutdown().await.unwrap();
        assert_eq!(handle.received(), vec!["exit"]);
        assert!(handle.has_exited());
    }

    /// Engine names that logged at `error` level, across all threads
    fn error_events() -> &'static Mutex<Vec<String>> {
        use tracing::field::{Field, Visit};
        use tracing_subscriber::layer::{Context, SubscriberExt};
        use tracing_subscriber::util::SubscriberInitExt;

        static EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());
        static INSTALL: std::sync::Once = std::sync::Once::new();

        struct EngineField(Option<String>);

        impl Visit for EngineField {
            fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
                if field.name() == "engine" {
                    self.0 = Some(format!("{:?}", value));
                }
            }
        }

        struct ErrorCapture;

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorCapture {
            fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
                if *event.metadata().level() == tracing::Level::ERROR {
                    let mut engine = EngineField(None);
                    event.record(&mut engine);
                    if let Some(engine) = engine.0 {
                        EVENTS.lock().unwrap().push(engine);
                    }
                }
            }
        }

        INSTALL.call_once(|| {
            let _ = tracing_subscriber::registry().with(ErrorCapture).try_init();
        });
        &EVENTS
    }

    #[tokio::test]
    async fn test_exit_eof_is_a_clean_completion() {
        let errors = error_events();
        let (backend, handle) = echo_script().build();
        let engine = ProtocolEngine::launch(backend, options("clean-exit")).await.unwrap();

        engine.send_exit().unwrap().drain().await.unwrap();
        assert!(handle.has_exited());
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.is_busy());

        engine.shutdown().await.unwrap();
        assert!(!errors.lock().unwrap().iter().any(|e| e == "clean-exit"));
    }

    #[tokio::test]
    async fn test_shutdown_logs_no_errors() {
        let errors = error_events();
        let (backend, handle) = echo_script().build();
        let engine = ProtocolEngine::launch(backend, options("quiet-bye")).await.unwrap();
        engine.shutdown().await.unwrap();
        assert!(handle.has_exited());
        assert!(!handle.was_killed());
        assert!(!errors.lock().unwrap().iter().any(|e| e == "quiet-bye"));
    }

    #[tokio::test]
    async fn test_exit_eof_elsewhere_still_faults() {
        let (backend, _handle) = echo_script().build();
        let engine = ProtocolEngine::launch(backend, options("plain-exit")).await.unwrap();
        let err = engine
            .send(Command::new("exit").unwrap())
            .unwrap()
            .drain()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendClosed));
        assert_eq!(engine.state(), EngineState::Faulted);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_kills_backend_ignoring_exit() {
        let script = ScriptedBackend::new(|_| ScriptReply::lines(Vec::<String>::new()));
        let (backend, handle) = script.build();
        let engine = ProtocolEngine::launch(backend, options("stubborn")).await.unwrap();
        engine.shutdown().await.unwrap();
        assert_eq!(handle.received(), vec!["exit"]);
        assert!(handle.was_killed());
    }

    #[tokio::test]
    async fn test_drop_without_shutdown_kills_backend() {
        let (backend, handle) = echo_script().build();
        let engine = ProtocolEngine::launch(backend, options("dropped")).await.unwrap();
        drop(engine);
        assert!(handle.was_killed());
    }
}

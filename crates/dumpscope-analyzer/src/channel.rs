//! Single-command response channel
//!
//! Hands the lines of one command's response from the engine thread to one
//! async consumer. The writer side never blocks: every entry goes into an
//! unbounded queue and adds one permit to a counting semaphore that the reader
//! waits on. The stream ends with an end marker (or a failure).
//!
//! Channel state is recycled through a small process-wide pool once a response
//! has been fully consumed; [`ResponseChannel::clear_pool`] drops it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, Stream};
use tokio::sync::Semaphore;

use dumpscope_core::prelude::*;

use crate::text::LineView;

/// Idle channel states kept for reuse
const MAX_POOLED_CHANNELS: usize = 32;

static POOL: Mutex<Vec<Arc<ChannelShared>>> = Mutex::new(Vec::new());

enum Entry {
    Line(LineView),
    Failed(Error),
    End,
}

struct ChannelShared {
    queue: Mutex<VecDeque<Entry>>,
    ready: Semaphore,
}

impl ChannelShared {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Semaphore::new(0),
        }
    }

    fn push(&self, entry: Entry) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(entry);
        self.ready.add_permits(1);
    }

    fn pop(&self) -> Option<Entry> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Forget leftover permits and entries so the state can be reused
    fn reset(&self) {
        while let Ok(permit) = self.ready.try_acquire() {
            permit.forget();
        }
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Factory and pool management for response channels
pub struct ResponseChannel;

impl ResponseChannel {
    /// Open a channel, reusing pooled state when available
    pub fn open() -> (ResponseWriter, ResponseStream) {
        let shared = POOL
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| Arc::new(ChannelShared::new()));

        (
            ResponseWriter {
                shared: Arc::clone(&shared),
                finished: false,
            },
            ResponseStream {
                shared: Some(shared),
                done: false,
                received: 0,
                recycled: false,
            },
        )
    }

    /// Idle channel states waiting in the pool
    pub fn pooled() -> usize {
        POOL.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop every pooled channel state
    pub fn clear_pool() {
        POOL.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Producer half, owned by the engine thread for one exchange
pub struct ResponseWriter {
    shared: Arc<ChannelShared>,
    finished: bool,
}

impl ResponseWriter {
    /// Queue one response line; never blocks
    pub fn append(&self, line: LineView) {
        self.shared.push(Entry::Line(line));
    }

    /// End the response normally
    pub fn complete(mut self) {
        self.finished = true;
        self.shared.push(Entry::End);
    }

    /// End the response with an error the reader will observe
    pub fn fail(mut self, error: Error) {
        self.finished = true;
        self.shared.push(Entry::Failed(error));
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.push(Entry::Failed(Error::ChannelClosed));
        }
    }
}

/// Consumer half: the ordered lines of one command's response
///
/// There is exactly one reader per channel; it is not `Clone` and every read
/// takes `&mut self`.
pub struct ResponseStream {
    shared: Option<Arc<ChannelShared>>,
    done: bool,
    received: usize,
    recycled: bool,
}

impl ResponseStream {
    /// Wait for the next line. `Ok(None)` marks the end of the response.
    pub async fn next_line(&mut self) -> Result<Option<LineView>> {
        if self.done {
            return Ok(None);
        }
        let Some(shared) = self.shared.as_ref() else {
            return Ok(None);
        };

        let permit = shared
            .ready
            .acquire()
            .await
            .map_err(|_| Error::ChannelClosed)?;
        permit.forget();

        match shared.pop() {
            Some(Entry::Line(line)) => {
                self.received += 1;
                Ok(Some(line))
            }
            Some(Entry::End) => {
                self.done = true;
                self.recycle();
                Ok(None)
            }
            Some(Entry::Failed(error)) => {
                self.done = true;
                self.recycle();
                Err(error)
            }
            None => {
                // No terminal entry was seen, so the state is not reusable.
                self.done = true;
                self.shared = None;
                Err(Error::protocol("response channel signalled without an entry"))
            }
        }
    }

    /// Lines received so far
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Consume and drop the remaining lines, returning how many there were
    pub async fn drain(&mut self) -> Result<usize> {
        let mut count = 0;
        while self.next_line().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Materialize every remaining line as an owned string
    pub async fn collect_strings(mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await? {
            lines.push(line.text().into_owned());
        }
        Ok(lines)
    }

    /// Adapt into a `Stream` of lines
    pub fn into_stream(self) -> impl Stream<Item = Result<LineView>> {
        stream::unfold(self, |mut response| async move {
            match response.next_line().await {
                Ok(Some(line)) => Some((Ok(line), response)),
                Ok(None) => None,
                Err(e) => Some((Err(e), response)),
            }
        })
    }

    /// Return the shared state to the pool once the writer is gone.
    ///
    /// The writer may still be dropping after its last entry; the state then
    /// stays with this stream until `Drop`.
    fn recycle(&mut self) {
        if matches!(self.shared.as_ref(), Some(shared) if Arc::strong_count(shared) == 1) {
            self.return_to_pool();
        }
    }

    fn return_to_pool(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.reset();
        let mut pool = POOL.lock().unwrap_or_else(|e| e.into_inner());
        if pool.len() < MAX_POOLED_CHANNELS {
            pool.push(shared);
            self.recycled = true;
        }
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        // After a terminal entry the writer never touches the queue again.
        if self.done {
            self.return_to_pool();
        }
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("done", &self.done)
            .field("received", &self.received)
            .finish()
    }
}

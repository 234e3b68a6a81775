//! Newline splitting over a blocking byte stream
//!
//! [`LineSplitter`] pulls raw bytes through a [`RingByteBuffer`], decodes them
//! into the tail of a pooled text buffer and cuts complete lines off the front
//! as [`LineView`]s. Nothing is copied: a line that straddles two pooled
//! buffers becomes a two-segment view.
//!
//! ## States
//!
//! ```text
//! FirstRun ─► Refill ─► ScanForNewline ─► (yield line) ─► ScanForNewline
//!               ▲  │            │
//!               │  │            └─ no newline ─► Refill
//!               │  └─ buffer full ─► RolloverBuffer ─► Refill
//!               └──────────────────────────────────────┘
//! Refill ─ end of stream ─► Drain ─► Finished
//! ```
//!
//! The splitter only reads from the stream when no complete line is buffered,
//! so a caller that stops at a sentinel line never blocks on bytes the
//! backend has not produced yet.

use std::io::Read;

use dumpscope_core::prelude::*;

use super::decode::{Newline, TextDecoder, MAX_CHAR_BYTES};
use super::pool::{BufferPool, LineView, PooledBuffer, Segment};
use super::ring::RingByteBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitState {
    FirstRun,
    Refill,
    ScanForNewline,
    RolloverBuffer,
    Drain,
    Finished,
}

/// Forward-only sequence of lines read from a byte stream
pub struct LineSplitter<R> {
    reader: R,
    ring: RingByteBuffer,
    decoder: Box<dyn TextDecoder>,
    newline: Newline,
    pool: BufferPool,
    state: SplitState,
    current: Option<PooledBuffer>,
    /// Undelimited text rolled over from earlier buffers, oldest first
    pending: Vec<Segment>,
    /// Offset in `current` where the next newline scan starts
    scan_from: usize,
    /// `pending` ends with the first byte of a two-byte newline
    split_check: bool,
    eof: bool,
}

impl<R: Read> LineSplitter<R> {
    pub fn new(
        reader: R,
        decoder: Box<dyn TextDecoder>,
        newline: Newline,
        pool: BufferPool,
        ring_capacity: usize,
    ) -> Self {
        Self {
            reader,
            ring: RingByteBuffer::new(ring_capacity),
            decoder,
            newline,
            pool,
            state: SplitState::FirstRun,
            current: None,
            pending: Vec::new(),
            scan_from: 0,
            split_check: false,
            eof: false,
        }
    }

    pub fn state(&self) -> SplitState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == SplitState::Finished
    }

    pub fn newline(&self) -> Newline {
        self.newline
    }

    /// Next complete line, or `None` once the stream has ended and all
    /// leftover text has been emitted.
    pub fn next_line(&mut self) -> Result<Option<LineView>> {
        loop {
            match self.state {
                SplitState::FirstRun => match self.claim() {
                    Ok(buffer) => {
                        self.current = Some(buffer);
                        self.state = SplitState::Refill;
                    }
                    Err(e) => {
                        self.finish();
                        return Err(e);
                    }
                },
                SplitState::Refill => {
                    if let Err(e) = self.refill() {
                        self.finish();
                        return Err(e);
                    }
                }
                SplitState::ScanForNewline => {
                    if let Some(line) = self.scan() {
                        return Ok(Some(line));
                    }
                }
                SplitState::RolloverBuffer => {
                    if let Err(e) = self.rollover() {
                        self.finish();
                        return Err(e);
                    }
                }
                SplitState::Drain => {
                    let line = self.drain();
                    self.finish();
                    if line.is_some() {
                        return Ok(line);
                    }
                }
                SplitState::Finished => return Ok(None),
            }
        }
    }

    fn claim(&self) -> Result<PooledBuffer> {
        let buffer = self.pool.claim();
        if buffer.remaining() < MAX_CHAR_BYTES + self.newline.len() {
            return Err(Error::protocol(format!(
                "text buffer of {} bytes cannot hold a line fragment",
                buffer.remaining()
            )));
        }
        Ok(buffer)
    }

    fn refill(&mut self) -> Result<()> {
        let Some(current) = self.current.as_mut() else {
            self.state = SplitState::FirstRun;
            return Ok(());
        };

        if !self.ring.has_data() && !self.eof && !self.ring.fill(&mut self.reader)? {
            trace!("line splitter reached end of stream");
            self.eof = true;
        }

        let decoded = self
            .ring
            .decode(self.decoder.as_mut(), current.storage_mut(), self.eof);

        self.state = if decoded.written > 0 {
            SplitState::ScanForNewline
        } else if decoded.exhausted && self.eof {
            SplitState::Drain
        } else if self.ring.has_data() || self.eof {
            // Bytes (or a final flush) are waiting but nothing fits.
            SplitState::RolloverBuffer
        } else {
            // Everything read so far is parked inside the decoder.
            SplitState::Refill
        };
        Ok(())
    }

    fn scan(&mut self) -> Option<LineView> {
        let token = self.newline.as_bytes();
        let current = self.current.as_mut()?;

        if self.split_check {
            self.split_check = false;
            if token.len() == 2 && current.as_bytes().first() == Some(&token[1]) {
                if let Some(last) = self.pending.last_mut() {
                    last.truncate(last.len() - 1);
                }
                current.skip(1);
                self.scan_from = 0;
                return self.take_line(None);
            }
        }

        let window = &current.as_bytes()[self.scan_from..];
        match self.newline.find(window) {
            Some(pos) => {
                let at = self.scan_from + pos;
                let segment = current.split_view(at);
                current.skip(token.len());
                self.scan_from = 0;
                self.take_line(Some(segment))
            }
            None => {
                self.scan_from = current.len().saturating_sub(token.len() - 1);
                self.state = SplitState::Refill;
                None
            }
        }
    }

    fn rollover(&mut self) -> Result<()> {
        let Some(current) = self.current.as_mut() else {
            self.state = SplitState::FirstRun;
            return Ok(());
        };

        if current.compact() && current.remaining() >= MAX_CHAR_BYTES {
            trace!(buffer = current.id(), "reusing text buffer in place");
            self.state = SplitState::Refill;
            return Ok(());
        }

        let from = current.id();
        if !current.is_empty() {
            let tail = current.split_all();
            self.split_check = self.newline.len() == 2
                && tail.last_byte() == Some(self.newline.as_bytes()[0]);
            self.pending.push(tail);
        }

        let fresh = self.claim()?;
        trace!(
            from,
            to = fresh.id(),
            pending = self.pending.len(),
            "rolling line over into a fresh buffer"
        );
        self.current = Some(fresh);
        self.scan_from = 0;
        self.state = SplitState::Refill;
        Ok(())
    }

    fn drain(&mut self) -> Option<LineView> {
        let tail = match self.current.as_mut() {
            Some(current) if !current.is_empty() => Some(current.split_all()),
            _ => None,
        };
        if tail.is_none() && self.pending.is_empty() {
            return None;
        }
        self.take_line(tail)
    }

    /// Join rolled-over text with the final segment into one view
    fn take_line(&mut self, last: Option<Segment>) -> Option<LineView> {
        let mut segments = std::mem::take(&mut self.pending);
        if let Some(segment) = last {
            if segment.is_empty() && !segments.is_empty() {
                // Empty tail in a fresh buffer adds nothing but a reference.
            } else {
                segments.push(segment);
            }
        }
        if segments.is_empty() {
            // Empty line whose delimiter straddled the buffer boundary.
            return self.empty_line();
        }
        LineView::from_segments(segments)
    }

    fn empty_line(&mut self) -> Option<LineView> {
        let current = self.current.as_mut()?;
        LineView::from_segments(vec![current.split_view(0)])
    }

    fn finish(&mut self) {
        self.state = SplitState::Finished;
        self.pending.clear();
        self.current = None;
    }
}

impl<R: Read> Iterator for LineSplitter<R> {
    type Item = Result<LineView>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_line().transpose()
    }
}

impl<R> std::fmt::Debug for LineSplitter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineSplitter")
            .field("state", &self.state)
            .field("newline", &self.newline)
            .field("pending", &self.pending.len())
            .field("eof", &self.eof)
            .finish()
    }
}

//! Pool of started engines handed out one lease at a time

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{mpsc, Mutex};

use dumpscope_analyzer::{EngineState, ProtocolEngine};
use dumpscope_core::prelude::*;

struct PoolInner {
    /// Waiting leasers queue on this lock in arrival order
    idle: Mutex<mpsc::UnboundedReceiver<ProtocolEngine>>,
    returns: mpsc::UnboundedSender<ProtocolEngine>,
    size: usize,
    /// Commands run by leases that have been returned
    commands: AtomicU64,
}

/// Fixed set of started engines. Cloning shares the same engines.
#[derive(Clone)]
pub struct EnginePool {
    inner: Arc<PoolInner>,
}

impl EnginePool {
    pub fn new(engines: Vec<ProtocolEngine>) -> Result<Self> {
        if engines.is_empty() {
            return Err(Error::config_invalid("engine pool needs at least one engine"));
        }
        let size = engines.len();
        let (returns, idle) = mpsc::unbounded_channel();
        let mut commands = 0;
        for engine in engines {
            commands += engine.commands_executed();
            // The receiver is alive, so this cannot fail.
            let _ = returns.send(engine);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                returns,
                size,
                commands: AtomicU64::new(commands),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Commands completed by engines currently in the pool or returned to it
    pub fn commands_executed(&self) -> u64 {
        self.inner.commands.load(Ordering::Relaxed)
    }

    /// Wait for an idle engine
    pub async fn lease(&self) -> Result<EngineLease> {
        let engine = self
            .inner
            .idle
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ChannelClosed)?;
        trace!(engine = %engine.name(), "Engine leased");
        Ok(EngineLease {
            baseline: engine.commands_executed(),
            engine: Some(engine),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Wait for every lease to come back, then shut all engines down.
    ///
    /// Blocks as long as any lease is still held.
    pub async fn shutdown(self) -> Result<()> {
        let mut engines = Vec::with_capacity(self.inner.size);
        {
            let mut idle = self.inner.idle.lock().await;
            while engines.len() < self.inner.size {
                match idle.recv().await {
                    Some(engine) => engines.push(engine),
                    None => break,
                }
            }
        }
        info!(engines = engines.len(), "Shutting down engine pool");

        let results = join_all(engines.into_iter().map(ProtocolEngine::shutdown)).await;
        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                error!("Engine shutdown failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePool")
            .field("size", &self.inner.size)
            .field("commands_executed", &self.commands_executed())
            .finish()
    }
}

/// Exclusive use of one pooled engine; returned to the pool on drop
pub struct EngineLease {
    engine: Option<ProtocolEngine>,
    pool: Arc<PoolInner>,
    baseline: u64,
}

impl Deref for EngineLease {
    type Target = ProtocolEngine;

    fn deref(&self) -> &ProtocolEngine {
        match self.engine.as_ref() {
            Some(engine) => engine,
            None => unreachable!("engine is only taken in drop"),
        }
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        let ran = engine.commands_executed().saturating_sub(self.baseline);
        self.pool.commands.fetch_add(ran, Ordering::Relaxed);
        if engine.state() == EngineState::Faulted {
            warn!(engine = %engine.name(), "Returning faulted engine to pool");
        }
        if self.pool.returns.send(engine).is_err() {
            warn!("Engine pool is gone, dropping engine");
        }
    }
}

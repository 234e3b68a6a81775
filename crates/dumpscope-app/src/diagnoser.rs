//! Parallel analysis of one dump across several debugger processes
//!
//! [`DumpDiagnoser`] owns an [`EnginePool`] and spreads independent work
//! (string reads, stack walks, object dumps) over it in batches. Each batch
//! runs on one leased engine; results come back in input order regardless of
//! which engine finished first.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde::Serialize;

use dumpscope_analyzer::{BufferPool, LocalProcess, ProtocolEngine};
use dumpscope_core::prelude::*;
use dumpscope_core::{AnalyzerStackFrame, HeapEntry, HeapScope, ThreadDetails};

use crate::config::Settings;
use crate::pool::{EngineLease, EnginePool};
use crate::progress::{Progress, ProgressSink};

/// Stack of one managed thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStack {
    pub thread: ThreadDetails,
    pub frames: Vec<AnalyzerStackFrame>,
}

pub struct DumpDiagnoser {
    pool: EnginePool,
    batch_size: usize,
    progress: Arc<dyn ProgressSink>,
    categories: Mutex<BTreeMap<String, f64>>,
}

impl DumpDiagnoser {
    /// Start `degree_of_parallelism` local debuggers on `dump` in parallel.
    ///
    /// If any engine fails to start, the ones that did start are shut down
    /// and the first failure is returned.
    pub async fn start(
        dump: &Path,
        settings: &Settings,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        settings.validate()?;
        if !dump.exists() {
            return Err(Error::dump_not_found(dump));
        }
        let local = settings.local_options()?;
        let buffers = BufferPool::new(settings.analyzer.text_buffer_bytes);
        let count = settings.analyzer.degree_of_parallelism;
        info!(engines = count, dump = %dump.display(), "Starting debuggers");

        let launches = (0..count).map(|index| {
            let options = settings.engine_options(format!("engine-{}", index));
            let buffers = buffers.clone();
            let local = local.clone();
            async move {
                let backend = LocalProcess::spawn_dotnet_dump(dump, &local)
                    .with_context(|| format!("engine-{}: spawning dotnet-dump", index))?;
                let mut engine = ProtocolEngine::with_pool(backend, options, buffers);
                engine
                    .start()
                    .await
                    .with_context(|| format!("engine-{}: waiting for the first prompt", index))?;
                Ok::<_, Error>(engine)
            }
        });

        let mut engines = Vec::with_capacity(count);
        let mut first_error = None;
        for result in join_all(launches).await {
            match result {
                Ok(engine) => engines.push(engine),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            join_all(engines.into_iter().map(ProtocolEngine::shutdown)).await;
            return Err(e);
        }

        Self::from_engines(engines, settings.fan_out.batch_size, progress)
    }

    /// Wrap already started engines
    pub fn from_engines(
        engines: Vec<ProtocolEngine>,
        batch_size: usize,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        Ok(Self {
            pool: EnginePool::new(engines)?,
            batch_size: batch_size.max(1),
            progress,
            categories: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Lease a single engine for ad-hoc commands
    pub async fn lease(&self) -> Result<EngineLease> {
        self.pool.lease().await
    }

    /// Map `op` over `items` in batches of `batch_size`, one engine lease per
    /// batch, and return the results in input order.
    ///
    /// Batches are dispatched as engines become free. Progress for `category`
    /// is reported as each batch completes. The first failing batch
    /// ends the call with its error; batches already running finish in the
    /// background and return their engines.
    pub async fn fan_out<T, R, F, Fut>(
        &self,
        category: &str,
        items: Vec<T>,
        batch_size: usize,
        op: F,
    ) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(EngineLease, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>>> + Send + 'static,
    {
        let batch_size = batch_size.max(1);
        let total_items = items.len();
        let batches = into_batches(items, batch_size);
        let total_batches = batches.len();
        debug!(category, total_items, total_batches, "Fanning out");

        self.report(category, 0, total_batches);
        if total_batches == 0 {
            return Ok(Vec::new());
        }

        let op = Arc::new(op);
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut dispatched = 0;
        let mut slots: Vec<Option<Vec<R>>> = (0..total_batches).map(|_| None).collect();
        let mut pending = batches.into_iter().enumerate();
        let mut completed = 0;

        while completed < total_batches {
            // Keep every free engine busy before waiting for a result.
            while dispatched < total_batches && dispatched - completed < self.pool.size() {
                let Some((index, batch)) = pending.next() else {
                    break;
                };
                let lease = self.pool.lease().await?;
                let op = Arc::clone(&op);
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let result = op(lease, batch).await;
                    let _ = done_tx.send((index, result));
                });
                dispatched += 1;
            }

            let Some((index, result)) = done_rx.recv().await else {
                return Err(Error::ChannelClosed);
            };
            match result {
                Ok(batch) => slots[index] = Some(batch),
                Err(e) => {
                    error!(category, batch = index, "Batch failed: {}", e);
                    return Err(e);
                }
            }
            completed += 1;
            self.report(category, completed, total_batches);
        }

        let mut results = Vec::with_capacity(total_items);
        for slot in slots {
            results.extend(slot.ok_or(Error::ChannelClosed)?);
        }
        Ok(results)
    }

    /// Live and dead heap objects, listed concurrently on two engines
    pub async fn load_heap(&self) -> Result<Vec<HeapEntry>> {
        let listings = self
            .fan_out(
                "heap",
                vec![HeapScope::Live, HeapScope::Dead],
                1,
                |engine, scopes| async move {
                    let mut entries = Vec::new();
                    for scope in scopes {
                        entries.push(engine.heap_entries(scope).await?);
                    }
                    Ok(entries)
                },
            )
            .await?;
        Ok(listings.into_iter().flatten().collect())
    }

    /// Contents of the `System.String` objects at `addresses`, in order
    pub async fn load_strings(&self, addresses: Vec<u64>) -> Result<Vec<String>> {
        self.fan_out(
            "strings",
            addresses,
            self.batch_size,
            |engine, batch| async move {
                let mut values = Vec::with_capacity(batch.len());
                for address in batch {
                    values.push(engine.string_value(address).await?);
                }
                Ok(values)
            },
        )
        .await
    }

    /// Managed stacks of every thread the debugger lists
    pub async fn load_stacks(&self) -> Result<Vec<ThreadStack>> {
        let threads = self.pool.lease().await?.threads().await?;
        self.fan_out(
            "stacks",
            threads,
            self.batch_size,
            |engine, batch| async move {
                let mut stacks = Vec::with_capacity(batch.len());
                for thread in batch {
                    let frames = engine.stack_frames(thread.index).await?;
                    stacks.push(ThreadStack { thread, frames });
                }
                Ok(stacks)
            },
        )
        .await
    }

    /// Shut every engine down once all leases are back
    pub async fn shutdown(self) -> Result<()> {
        let commands = self.pool.commands_executed();
        let result = self.pool.shutdown().await;
        info!(commands, "Diagnoser shut down");
        result
    }

    fn report(&self, category: &str, done: usize, total: usize) {
        let percent = if total == 0 {
            100.0
        } else {
            done as f64 * 100.0 / total as f64
        };
        let categories = {
            let mut categories = self.categories.lock().unwrap_or_else(|e| e.into_inner());
            categories.insert(category.to_string(), percent);
            categories.clone()
        };
        self.progress.report(&Progress {
            categories,
            commands_executed: self.pool.commands_executed(),
        });
    }
}

fn into_batches<T>(items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut current = Vec::with_capacity(batch_size);
    for item in items {
        current.push(item);
        if current.len() == batch_size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use dumpscope_analyzer::test_utils::{ScriptReply, ScriptedBackend};
    use dumpscope_analyzer::EngineOptions;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingProgress {
        reports: Mutex<Vec<Progress>>,
    }

    impl ProgressSink for RecordingProgress {
        fn report(&self, progress: &Progress) {
            self.reports.lock().unwrap().push(progress.clone());
        }
    }

    /// A fake debugger that knows a few strings and two threads
    fn reply(command: &str) -> ScriptReply {
        match command {
            "exit" => ScriptReply::Exit,
            "dumpheap -live" => ScriptReply::lines([
                "         Address               MT           Size",
                "    7f4e2a400018     7f4e2e9a1b48             24 ",
            ]),
            "dumpheap -dead" => ScriptReply::lines([
                "    7f4e2a500018     7f4e2e9a1b48             32 ",
                "    7f4e2a500040     7f4e2e9a1b48             32 Free",
            ]),
            "threads" => ScriptReply::lines(["*0 0x1A2B (6699)", " 1 0x1A2C (6700)"]),
            "clrstack" => ScriptReply::lines([
                "        Child SP               IP Call Site",
                "00007FFD1F6FE6A8 00007ffe0c12ab34 MyApp.Program.Main()",
            ]),
            other if other.starts_with("dd -c 1 ") => {
                // String at N000 has length N
                let digit = other.as_bytes()[8] - b'0';
                ScriptReply::lines([format!("{}: {:08x}", &other[8..], digit)])
            }
            other if other.starts_with("dw ") => {
                // Every string's characters are 'A's
                let base = other.rsplit(' ').next().and_then(|a| u64::from_str_radix(a, 16).ok());
                ScriptReply::memory_words(other, base.unwrap_or(0), &[0x41; 16])
            }
            _ => ScriptReply::lines(Vec::<String>::new()),
        }
    }

    async fn diagnoser(engines: usize, batch_size: usize) -> (DumpDiagnoser, Arc<RecordingProgress>) {
        let mut started = Vec::new();
        for i in 0..engines {
            let (backend, _handle) = ScriptedBackend::new(reply).with_max_read(5).build();
            let options = EngineOptions {
                shutdown_timeout: Duration::from_millis(200),
                ..EngineOptions::named(format!("diag-{}", i))
            };
            started.push(ProtocolEngine::launch(backend, options).await.unwrap());
        }
        let progress = Arc::new(RecordingProgress::default());
        let diagnoser = DumpDiagnoser::from_engines(started, batch_size, progress.clone()).unwrap();
        (diagnoser, progress)
    }

    #[test]
    fn test_into_batches() {
        let batches = into_batches((0..7).collect(), 3);
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert!(into_batches(Vec::<u8>::new(), 3).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn test_fan_out_keeps_input_order() {
        let (diagnoser, progress) = diagnoser(3, 2).await;

        let items: Vec<u32> = (0..20).collect();
        let doubled = diagnoser
            .fan_out("numbers", items, 3, |engine, batch| async move {
                let mut out = Vec::new();
                for n in batch {
                    // Exercise the engine so batches interleave across engines.
                    engine.execute_raw(&format!("echo {}", n)).await?;
                    out.push(n * 2);
                }
                Ok(out)
            })
            .await
            .unwrap();

        assert_eq!(doubled, (0..20).map(|n| n * 2).collect::<Vec<_>>());
        let reports = progress.reports.lock().unwrap().clone();
        assert_eq!(reports.first().unwrap().percent("numbers"), Some(0.0));
        assert_eq!(reports.last().unwrap().percent("numbers"), Some(100.0));
        assert_eq!(reports.len(), 1 + 7);
        diagnoser.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fan_out_propagates_batch_error() {
        let (diagnoser, _progress) = diagnoser(2, 1).await;
        let result = diagnoser
            .fan_out("failing", vec![1, 2, 3], 1, |_engine, batch| async move {
                if batch.contains(&2) {
                    Err(Error::missing_record("test", "value"))
                } else {
                    Ok(batch)
                }
            })
            .await;
        assert!(matches!(result, Err(Error::MissingRecord { .. })));
        diagnoser.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_heap_merges_live_and_dead() {
        let (diagnoser, _progress) = diagnoser(2, 4).await;
        let heap = diagnoser.load_heap().await.unwrap();
        assert_eq!(heap.len(), 2);
        assert!(heap[0].live);
        assert!(!heap[1].live);
        assert_eq!(heap[1].size_bytes, 32);
        diagnoser.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_load_strings_in_order() {
        let (diagnoser, progress) = diagnoser(2, 2).await;
        let strings = diagnoser
            .load_strings(vec![0x1000, 0x3000, 0x2000, 0x4000])
            .await
            .unwrap();
        assert_eq!(strings, vec!["A", "AAA", "AA", "AAAA"]);

        let last = progress.reports.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.percent("strings"), Some(100.0));
        assert!(last.commands_executed >= 4);
        diagnoser.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_stacks_walks_every_thread() {
        let (diagnoser, _progress) = diagnoser(2, 1).await;
        let stacks = diagnoser.load_stacks().await.unwrap();
        assert_eq!(stacks.len(), 2);
        assert!(stacks[0].thread.is_current);
        assert_eq!(stacks[1].thread.index, 1);
        assert_eq!(stacks[1].frames[0].call_site, "MyApp.Program.Main()");
        diagnoser.shutdown().await.unwrap();
    }
}

#[cfg(all(test, unix))]
mod start_tests {
    use super::*;
    use crate::progress::NoProgress;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    const FAKE_DOTNET_DUMP: &str = r#"#!/bin/sh
echo "Loading core dump: $2 ..."
echo "<END_COMMAND_OUTPUT>"
while IFS= read -r line; do
  case "$line" in
    exit) exit 0 ;;
    threads) echo "*0 0x1A2B (6699)" ;;
  esac
  echo "<END_COMMAND_OUTPUT>"
done
"#;

    /// Settings pointing at a shell script in place of `dotnet-dump`
    fn settings_with_tool(dir: &Path, script: &str, engines: usize) -> Settings {
        let tool = dir.join("dotnet-dump");
        std::fs::write(&tool, script).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut settings = Settings::default();
        settings.analyzer.dotnet_dump_path = Some(tool);
        settings.analyzer.degree_of_parallelism = engines;
        settings.analyzer.shutdown_timeout_ms = 2000;
        settings
    }

    fn dump_file(dir: &Path) -> PathBuf {
        let dump = dir.join("app.dmp");
        std::fs::write(&dump, b"").unwrap();
        dump
    }

    #[tokio::test]
    #[serial]
    async fn test_start_runs_every_engine() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings_with_tool(temp.path(), FAKE_DOTNET_DUMP, 2);
        let dump = dump_file(temp.path());

        let diagnoser = DumpDiagnoser::start(&dump, &settings, Arc::new(NoProgress))
            .await
            .unwrap();
        assert_eq!(diagnoser.pool().size(), 2);
        let engine = diagnoser.lease().await.unwrap();
        assert_eq!(engine.threads().await.unwrap().len(), 1);
        drop(engine);
        diagnoser.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_start_fails_when_debugger_dies() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings_with_tool(temp.path(), "#!/bin/sh\nexit 1\n", 2);
        let dump = dump_file(temp.path());

        let err = DumpDiagnoser::start(&dump, &settings, Arc::new(NoProgress))
            .await
            .err()
            .unwrap();
        assert!(err.is_fatal(), "unexpected error: {:?}", err);
    }

    #[tokio::test]
    #[serial]
    async fn test_start_rejects_missing_dump() {
        let temp = tempfile::tempdir().unwrap();
        let settings = settings_with_tool(temp.path(), FAKE_DOTNET_DUMP, 1);
        let err = DumpDiagnoser::start(&temp.path().join("gone.dmp"), &settings, Arc::new(NoProgress))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::DumpNotFound { .. }));
    }
}

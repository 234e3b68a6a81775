//! Drives a real child process that speaks the batch debugger protocol.

#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use dumpscope_analyzer::{
    Command, Dialect, Encoding, EngineOptions, EngineState, LocalProcess, Newline, ProtocolEngine,
};
use dumpscope_core::Error;

const FAKE_DEBUGGER: &str = r#"
echo "Loading core dump: fake.dmp ..."
echo "Ready to process analysis commands. Type 'help' to list available commands."
echo "<END_COMMAND_OUTPUT>"
while IFS= read -r line; do
  case "$line" in
    exit) exit 0 ;;
    crash) exit 3 ;;
    threads)
      echo "> threads"
      echo "*0 0x1A2B (6699)"
      echo " 1 0x1A2C (6700)"
      ;;
    "dumpheap -stat")
      echo "> dumpheap -stat"
      echo "Statistics:"
      echo "              MT    Count    TotalSize Class Name"
      echo "00007ffe8a6b5c10        3           72 System.Object"
      echo "00007ffe8a6c1e18       10          480 System.String"
      echo "Total 13 objects, 552 bytes"
      ;;
    *)
      echo "> $line"
      echo "Unrecognized SOS command '$line'"
      ;;
  esac
  echo "<END_COMMAND_OUTPUT>"
done
"#;

async fn launch(name: &str) -> ProtocolEngine {
    let backend = LocalProcess::spawn_program(
        Path::new("sh"),
        ["-c", FAKE_DEBUGGER],
        Encoding::Utf8,
        Newline::LF,
        Dialect::DotnetDump,
    )
    .expect("sh should spawn");
    ProtocolEngine::launch(
        backend,
        EngineOptions {
            shutdown_timeout: Duration::from_secs(2),
            ..EngineOptions::named(name)
        },
    )
    .await
    .expect("fake debugger should print its banner")
}

#[tokio::test]
async fn test_typed_operations_against_child_process() {
    let engine = launch("proc-typed").await;

    let threads = engine.threads().await.unwrap();
    assert_eq!(threads.len(), 2);
    assert!(threads[0].is_current);
    assert_eq!(threads[1].os_thread_id, 0x1a2c);

    let stats = engine.heap_statistics().await.unwrap();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[1].type_name, "System.String");
    assert_eq!(stats[1].total_size, 480);

    assert_eq!(engine.commands_executed(), 2);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_raw_command_and_clean_exit() {
    let engine = launch("proc-raw").await;
    assert_eq!(engine.state(), EngineState::Idle);

    let lines = engine.execute_raw("help").await.unwrap();
    assert_eq!(lines, vec!["Unrecognized SOS command 'help'"]);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn test_three_processes_in_parallel() {
    let mut tasks = Vec::new();
    for id in 0..3 {
        tasks.push(tokio::spawn(async move {
            let engine = launch(&format!("proc-{}", id)).await;
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(engine.threads().await.unwrap().len());
                seen.push(engine.heap_statistics().await.unwrap().len());
            }
            engine.shutdown().await.unwrap();
            seen
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), [2, 2].repeat(5));
    }
}

#[tokio::test]
async fn test_crashed_process_reports_exit_code() {
    let engine = launch("proc-crash").await;

    let err = engine.execute_raw("crash").await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(engine.state(), EngineState::Faulted);

    // Output closes a moment before the process can be reaped.
    let mut last = None;
    for _ in 0..100 {
        match engine.send(Command::new("threads").unwrap()) {
            Err(Error::BackendExited { code }) => {
                last = Some(code);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            Ok(_) => panic!("faulted engine accepted a command"),
        }
    }
    assert_eq!(last, Some(Some(3)));
    engine.shutdown().await.unwrap();
}

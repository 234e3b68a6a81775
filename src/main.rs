//! dumpscope - parallel .NET heap analysis from the command line
//!
//! This is the binary entry point. All logic lives in the workspace crates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dumpscope_analyzer::{parsers, LocalProcess, ProtocolEngine};
use dumpscope_app::{
    collect_dump, load_settings_or_default, CollectOptions, DumpDiagnoser, Settings,
    TracingProgress,
};
use dumpscope_core::prelude::*;
use dumpscope_core::TypeStatistic;

/// dumpscope - parallel .NET heap analysis
#[derive(Parser, Debug)]
#[command(name = "dumpscope")]
#[command(about = "Parallel .NET heap analysis over dotnet-dump", long_about = None)]
struct Args {
    /// Config file (defaults to <config dir>/dumpscope/config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Number of debugger processes to run
    #[arg(long, short = 'j', global = true)]
    parallelism: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one raw debugger command and print its output
    Exec {
        dump: PathBuf,
        /// Command text, e.g. "dumpheap -stat"
        command: String,
    },
    /// Per-type heap totals, or every object with --objects
    Heap {
        dump: PathBuf,
        /// List live and dead objects instead of per-type totals
        #[arg(long)]
        objects: bool,
        #[arg(long)]
        json: bool,
    },
    /// Read System.String objects by address
    Strings {
        dump: PathBuf,
        /// Object addresses in hex
        #[arg(required = true)]
        addresses: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Managed stacks of every thread
    Stacks {
        dump: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a dump of a running .NET process
    Collect {
        pid: u32,
        output: PathBuf,
        /// Full, Heap or Mini
        #[arg(long = "type")]
        dump_type: Option<String>,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dumpscope_core::logging::init()?;

    let args = Args::parse();
    let mut settings = load_settings_or_default(args.config.as_deref());
    if let Some(parallelism) = args.parallelism {
        settings.analyzer.degree_of_parallelism = parallelism;
    }
    settings.validate()?;

    match args.command {
        Commands::Exec { dump, command } => exec(&dump, &command, &settings).await?,
        Commands::Heap {
            dump,
            objects,
            json,
        } => heap(&dump, objects, json, &settings).await?,
        Commands::Strings {
            dump,
            addresses,
            json,
        } => strings(&dump, &addresses, json, &settings).await?,
        Commands::Stacks { dump, json } => stacks(&dump, json, &settings).await?,
        Commands::Collect {
            pid,
            output,
            dump_type,
        } => {
            let options = CollectOptions {
                dump_type,
                ..CollectOptions::from_settings(&settings)
            };
            let written = collect_dump(pid, &output, &options).await?;
            eprintln!("Dump written to {}", written.display());
        }
    }
    Ok(())
}

async fn exec(dump: &Path, command: &str, settings: &Settings) -> Result<()> {
    let backend = LocalProcess::spawn_dotnet_dump(dump, &settings.local_options()?)?;
    let engine = ProtocolEngine::launch(backend, settings.engine_options("exec")).await?;
    let result = engine.execute_raw(command).await;
    engine.shutdown().await?;
    for line in result? {
        println!("{}", line);
    }
    Ok(())
}

async fn heap(dump: &Path, objects: bool, json: bool, settings: &Settings) -> Result<()> {
    let diagnoser = start(dump, settings).await?;
    let result = if objects {
        diagnoser.load_heap().await.map(HeapOutput::Objects)
    } else {
        match diagnoser.lease().await {
            Ok(engine) => engine.heap_statistics().await.map(HeapOutput::Stat),
            Err(e) => Err(e),
        }
    };
    diagnoser.shutdown().await?;

    match result? {
        HeapOutput::Stat(stats) if json => print_json(&stats),
        HeapOutput::Stat(stats) => print_statistics(&stats),
        HeapOutput::Objects(entries) if json => print_json(&entries),
        HeapOutput::Objects(entries) => {
            println!("{:>16} {:>16} {:>10} {}", "Address", "MT", "Size", "Live");
            for entry in &entries {
                println!(
                    "{:>16x} {:>16x} {:>10} {}",
                    entry.address, entry.method_table, entry.size_bytes, entry.live
                );
            }
            println!("Total {} objects", entries.len());
            Ok(())
        }
    }
}

enum HeapOutput {
    Stat(Vec<TypeStatistic>),
    Objects(Vec<dumpscope_core::HeapEntry>),
}

fn print_statistics(stats: &[TypeStatistic]) -> Result<()> {
    println!("{:>16} {:>10} {:>14} {}", "MT", "Count", "TotalSize", "Class Name");
    for stat in stats {
        println!(
            "{:>16x} {:>10} {:>14} {}",
            stat.method_table, stat.count, stat.total_size, stat.type_name
        );
    }
    Ok(())
}

async fn strings(dump: &Path, addresses: &[String], json: bool, settings: &Settings) -> Result<()> {
    let parsed = addresses
        .iter()
        .map(|text| {
            parsers::parse_hex(text)
                .ok_or_else(|| Error::config_invalid(format!("not a hex address: {}", text)))
        })
        .collect::<Result<Vec<u64>>>()?;

    let diagnoser = start(dump, settings).await?;
    let result = diagnoser.load_strings(parsed.clone()).await;
    diagnoser.shutdown().await?;
    let values = result?;

    if json {
        let pairs: Vec<_> = parsed
            .iter()
            .zip(&values)
            .map(|(address, value)| serde_json::json!({ "address": address, "value": value }))
            .collect();
        return print_json(&pairs);
    }
    for (address, value) in parsed.iter().zip(&values) {
        println!("{:x} {:?}", address, value);
    }
    Ok(())
}

async fn stacks(dump: &Path, json: bool, settings: &Settings) -> Result<()> {
    let diagnoser = start(dump, settings).await?;
    let result = diagnoser.load_stacks().await;
    diagnoser.shutdown().await?;
    let stacks = result?;

    if json {
        return print_json(&stacks);
    }
    for stack in &stacks {
        let marker = if stack.thread.is_current { "*" } else { " " };
        println!(
            "{}{} OS Thread Id: 0x{:x}",
            marker, stack.thread.index, stack.thread.os_thread_id
        );
        for frame in &stack.frames {
            println!(
                "    {:016x} {:016x} {}",
                frame.stack_pointer, frame.instruction_pointer, frame.call_site
            );
        }
    }
    Ok(())
}

async fn start(dump: &Path, settings: &Settings) -> Result<DumpDiagnoser> {
    DumpDiagnoser::start(dump, settings, Arc::new(TracingProgress)).await
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

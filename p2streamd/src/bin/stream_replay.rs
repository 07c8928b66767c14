//! Feed a USB recording through a pipeline and report what it contained.

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clap::Parser;
use log::info;

use p2streamd::config::Config;
use p2streamd::pipeline::Pipeline;
use p2streamd::pool::MessageHandle;
use p2streamd::recording::{Direction, RecordingReader};
use p2streamd::router::{Destination, RouteKey};

#[derive(Parser, Debug)]
#[command(name = "stream-replay")]
#[command(about = "Replay a recorded P2 debug stream through the pipeline")]
struct Args {
    /// Recording file written by the daemon's USB logging
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Ignore recorded timestamps and replay flat-out
    #[arg(long)]
    fast: bool,
    /// Print running totals every N records
    #[arg(long, value_name = "N")]
    stats_every: Option<u64>,
}

struct KindCounter {
    counts: Mutex<HashMap<&'static str, u64>>,
}

#[async_trait]
impl Destination for KindCounter {
    fn name(&self) -> &'static str {
        "kind-counter"
    }

    async fn deliver(&self, msg: MessageHandle) -> anyhow::Result<()> {
        if let Some(kind) = msg.kind() {
            *self.counts.lock().unwrap().entry(kind.label()).or_insert(0) += 1;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::default();
    config.logging.usb_logging_path = None;
    let (mut pipeline, handle) = Pipeline::new(config).await?;
    let metrics = pipeline.metrics();

    let counter = Arc::new(KindCounter {
        counts: Mutex::new(HashMap::new()),
    });
    for key in [
        RouteKey::TerminalOutput,
        RouteKey::CogMessage,
        RouteKey::SystemInit,
        RouteKey::WindowCommand,
        RouteKey::DbPacket,
        RouteKey::DebuggerFrame,
    ] {
        pipeline.register_destination(key, counter.clone());
    }

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let runner = tokio::spawn(pipeline.run(async {
        let _ = stop_rx.await;
    }));

    let mut reader = RecordingReader::open(&args.input)?;
    let start = tokio::time::Instant::now();
    let mut records = 0u64;
    let mut rx_bytes = 0u64;
    while let Some(record) = reader.next_record()? {
        if record.direction != Direction::Rx {
            continue;
        }
        if !args.fast {
            let due = start + std::time::Duration::from_micros(record.micros);
            tokio::time::sleep_until(due).await;
        }
        rx_bytes += record.bytes.len() as u64;
        while !handle.ingest(&record.bytes) {
            // Replays never drop: wait for the extractor to catch up.
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        records += 1;
        if let Some(every) = args.stats_every {
            if records % every == 0 {
                info!("{records} records, {rx_bytes} bytes replayed");
            }
        }
    }

    drop(handle);
    let _ = stop_tx.send(());
    runner.await?;

    println!("replayed {records} records ({rx_bytes} RX bytes)");
    let counts = counter.counts.lock().unwrap();
    let mut kinds: Vec<_> = counts.iter().collect();
    kinds.sort();
    for (kind, count) in kinds {
        println!("  {kind:>14}: {count}");
    }
    println!(
        "  framing errors: {}, overflows: {}",
        metrics.framing_errors(),
        metrics.buffer_overflows()
    );
    Ok(())
}

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use p2streamd::config::Config;
use p2streamd::handler::{CogLog, DebuggerFeed, TerminalLog, WindowFeed};
use p2streamd::pipeline::{Pipeline, PipelineHandle};
use p2streamd::recording::RecordingReader;
use p2streamd::router::RouteKey;

#[derive(Parser, Debug)]
#[command(name = "p2streamd")]
#[command(about = "P2 debug-stream ingestion daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH", default_value = "/etc/p2stream/p2streamd.toml")]
    config: PathBuf,
    /// Serial device (or FIFO/file) carrying the P2 debug stream
    #[arg(long, value_name = "PATH", default_value = "/dev/ttyUSB0")]
    serial: PathBuf,
    /// Feed a USB recording instead of the serial device
    #[arg(long, value_name = "PATH")]
    replay: Option<PathBuf>,
    /// Override the main log path from the config
    #[arg(long, value_name = "PATH")]
    log: Option<String>,
}

/// Pump the file or device into the pipeline, chunk by chunk.
async fn read_stream(path: PathBuf, handle: PipelineHandle) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let mut buf = vec![0u8; 4096];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if !handle.ingest(&buf[..n]) {
            // The drop is already counted and reported; do not retry.
            warn!("ring full, dropped a {n}-byte chunk");
        }
    }
}

/// Replay a recording at its original pacing.
async fn replay_stream(path: PathBuf, handle: PipelineHandle) -> anyhow::Result<()> {
    let mut reader = RecordingReader::open(&path)?;
    let start = tokio::time::Instant::now();
    while let Some(record) = reader.next_record()? {
        if record.direction != p2streamd::recording::Direction::Rx {
            continue;
        }
        let due = start + std::time::Duration::from_micros(record.micros);
        tokio::time::sleep_until(due).await;
        if !handle.ingest(&record.bytes) {
            warn!("ring full during replay, dropped {} bytes", record.bytes.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();
    info!("[p2streamd] starting");

    let mut config = Config::load_path(&args.config);
    if let Some(log) = args.log {
        config.logging.main_log = log;
    }
    let main_log = PathBuf::from(config.logging.main_log.clone());
    let cog_logs_enabled = config.logging.cog_logs;

    let (mut pipeline, handle) = Pipeline::new(config).await?;
    let metrics = pipeline.metrics();

    // Shared log for all text-bearing kinds.
    match TerminalLog::new(main_log.to_str().unwrap_or("p2stream.log")).await {
        Ok(log) => {
            let log = Arc::new(log);
            pipeline.register_destination(RouteKey::TerminalOutput, log.clone());
            pipeline.register_destination(RouteKey::CogMessage, log.clone());
            pipeline.register_destination(RouteKey::SystemInit, log);
        }
        Err(err) => warn!("main log unavailable ({err}); terminal output not persisted"),
    }

    // Per-COG collectors; the reboot marker counts as a COG-0 line.
    let cog_log = Arc::new(CogLog::new());
    if cog_logs_enabled {
        pipeline.register_destination(RouteKey::CogMessage, cog_log.clone());
        pipeline.register_destination(RouteKey::SystemInit, cog_log.clone());
    }

    // Window commands go to whoever draws; here they are just drained.
    let (window_feed, mut window_rx) = WindowFeed::new();
    pipeline.register_destination(RouteKey::WindowCommand, Arc::new(window_feed));
    tokio::spawn(async move {
        while let Some(cmd) = window_rx.recv().await {
            log::debug!("window command: {}", String::from_utf8_lossy(&cmd));
        }
    });

    // Binary records feed the protocol engine and the device cache.
    let feed = DebuggerFeed::new(pipeline.protocol(), pipeline.data_manager());
    let feed = Arc::new(feed);
    pipeline.register_destination(RouteKey::DbPacket, feed.clone());
    pipeline.register_destination(RouteKey::DebuggerFrame, feed);

    // Outgoing debugger requests go back to the device.
    let mut tx_rx = pipeline.tx_receiver().expect("tx receiver taken once");
    let tx_path = args.serial.clone();
    let tx_handle = handle.clone();
    let tx_task = tokio::spawn(async move {
        let mut port = match tokio::fs::OpenOptions::new().write(true).open(&tx_path).await {
            Ok(port) => Some(port),
            Err(err) => {
                warn!("serial TX unavailable ({err}); outgoing requests dropped");
                None
            }
        };
        while let Some(packet) = tx_rx.recv().await {
            tx_handle.record_tx(&packet);
            if let Some(port) = port.as_mut() {
                if let Err(err) = port.write_all(&packet).await {
                    warn!("serial TX write failed: {err}");
                }
            }
        }
    });

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let runner = tokio::spawn(pipeline.run(async {
        let _ = stop_rx.await;
    }));

    let reader_handle = handle.clone();
    let reader = async {
        match args.replay {
            Some(path) => replay_stream(path, reader_handle).await,
            None => read_stream(args.serial, reader_handle).await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("[p2streamd] interrupted, shutting down");
        }
        result = reader => {
            match result {
                Ok(()) => info!("[p2streamd] input stream finished"),
                Err(err) => warn!("[p2streamd] reader failed: {err:#}"),
            }
        }
    }

    // Drop every producer-side handle (the TX pump holds one) so the
    // recording writer can flush during the pipeline's drain.
    tx_task.abort();
    drop(handle);
    let _ = stop_tx.send(());
    runner.await?;

    if cog_logs_enabled {
        match cog_log.export(&main_log) {
            Ok(paths) => {
                for path in paths {
                    info!("wrote {}", path.display());
                }
            }
            Err(err) => warn!("COG log export failed: {err:#}"),
        }
    }

    info!(
        "[p2streamd] done: {} bytes, {} messages, {} overflows, {} framing errors, {} timeouts",
        metrics.bytes_total.load(std::sync::atomic::Ordering::Relaxed),
        metrics.messages_total.load(std::sync::atomic::Ordering::Relaxed),
        metrics.buffer_overflows(),
        metrics.framing_errors(),
        metrics.request_timeouts(),
    );
    Ok(())
}

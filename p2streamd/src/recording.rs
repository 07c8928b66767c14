//! USB traffic recording and replay.
//!
//! When enabled, every RX chunk (and optionally every TX packet) is
//! written to a framed binary file with a monotonic microsecond
//! timestamp: `u8 direction, u64 micros, u32 len, bytes`, all
//! little-endian. The writer runs on its own task so the ingest path
//! never touches the disk.

use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    Rx = 0,
    Tx = 1,
}

impl Direction {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Direction::Rx),
            1 => Some(Direction::Tx),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub direction: Direction,
    pub micros: u64,
    pub bytes: Bytes,
}

/// Cheap-to-clone handle the ingest and TX paths use to log traffic.
#[derive(Clone)]
pub struct UsbRecorder {
    tx: mpsc::UnboundedSender<Record>,
    start: Instant,
    log_tx: bool,
}

impl UsbRecorder {
    /// Open the recording file and spawn its writer task. Dropping every
    /// recorder clone lets the writer flush and exit; await the handle to
    /// be sure the file is complete.
    pub async fn start(
        path: &Path,
        log_tx: bool,
    ) -> anyhow::Result<(Self, tokio::task::JoinHandle<()>)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("opening USB recording {}", path.display()))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Record>();
        let handle = tokio::spawn(async move {
            let mut writer = BufWriter::new(file);
            while let Some(record) = rx.recv().await {
                let mut frame = Vec::with_capacity(13 + record.bytes.len());
                frame.push(record.direction as u8);
                frame.extend_from_slice(&record.micros.to_le_bytes());
                frame.extend_from_slice(&(record.bytes.len() as u32).to_le_bytes());
                frame.extend_from_slice(&record.bytes);
                if let Err(err) = writer.write_all(&frame).await {
                    log::error!("USB recording write failed: {err}");
                    break;
                }
            }
            if let Err(err) = writer.flush().await {
                log::error!("USB recording flush failed: {err}");
            }
        });
        Ok((
            Self {
                tx,
                start: Instant::now(),
                log_tx,
            },
            handle,
        ))
    }

    pub fn record_rx(&self, bytes: &[u8]) {
        self.push(Direction::Rx, bytes);
    }

    pub fn record_tx(&self, bytes: &[u8]) {
        if self.log_tx {
            self.push(Direction::Tx, bytes);
        }
    }

    fn push(&self, direction: Direction, bytes: &[u8]) {
        let record = Record {
            direction,
            micros: self.start.elapsed().as_micros() as u64,
            bytes: Bytes::copy_from_slice(bytes),
        };
        // A closed writer means we are shutting down; drop silently.
        let _ = self.tx.send(record);
    }
}

/// Sequential reader over a recording file.
pub struct RecordingReader {
    reader: BufReader<std::fs::File>,
}

impl RecordingReader {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening recording {}", path.display()))?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }

    /// The next record, or None at a clean end of file. A truncated
    /// trailing record is an error.
    pub fn next_record(&mut self) -> anyhow::Result<Option<Record>> {
        let mut dir = [0u8; 1];
        match self.reader.read_exact(&mut dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let direction = Direction::from_u8(dir[0])
            .ok_or_else(|| anyhow::anyhow!("bad direction byte {:#04x}", dir[0]))?;
        let mut micros = [0u8; 8];
        self.reader.read_exact(&mut micros)?;
        let mut len = [0u8; 4];
        self.reader.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        let mut bytes = vec![0u8; len];
        self.reader.read_exact(&mut bytes)?;
        Ok(Some(Record {
            direction,
            micros: u64::from_le_bytes(micros),
            bytes: Bytes::from(bytes),
        }))
    }
}

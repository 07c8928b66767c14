//! Per-COG log collection and export.
//!
//! Each COG's messages are buffered as they route through; `export`
//! writes one sibling file per COG that said anything, next to the main
//! log: `<basename>-cog<N>.log`. Silent COGs get no file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::classify::COG_COUNT;
use crate::pool::MessageHandle;
use crate::router::Destination;

const RULE: &str =
    "================================================================";

#[derive(Default)]
struct CogBuffer {
    count: u64,
    first_at: Option<DateTime<Utc>>,
    last_at: Option<DateTime<Utc>>,
    bytes: Vec<u8>,
}

pub struct CogLog {
    buffers: Mutex<Vec<CogBuffer>>,
}

impl CogLog {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new((0..COG_COUNT).map(|_| CogBuffer::default()).collect()),
        }
    }

    pub fn message_count(&self, cog: u8) -> u64 {
        self.buffers
            .lock()
            .unwrap()
            .get(cog as usize)
            .map(|b| b.count)
            .unwrap_or(0)
    }

    /// Write `<basename>-cog<N>.log` next to the main log for every COG
    /// with at least one message. Returns the paths written.
    pub fn export(&self, main_log: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let stem = main_log
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("debug");
        let dir = main_log.parent().unwrap_or_else(|| Path::new("."));
        let main_name = main_log
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("debug.log");

        let buffers = self.buffers.lock().unwrap();
        let mut written = Vec::new();
        for (cog, buf) in buffers.iter().enumerate() {
            if buf.count == 0 {
                continue;
            }
            let path = dir.join(format!("{stem}-cog{cog}.log"));
            let mut out = String::new();
            out.push_str(RULE);
            out.push('\n');
            out.push_str(&format!(" COG {cog} log\n"));
            out.push_str(&format!(" Main log: {main_name}\n"));
            out.push_str(RULE);
            out.push('\n');
            out.push_str(&format!(" Messages: {}\n", buf.count));
            if let Some(first) = buf.first_at {
                out.push_str(&format!(" First: {}\n", first.to_rfc3339()));
            }
            if let Some(last) = buf.last_at {
                out.push_str(&format!(" Last: {}\n", last.to_rfc3339()));
            }
            out.push_str(RULE);
            out.push('\n');
            let mut content = out.into_bytes();
            content.extend_from_slice(&buf.bytes);
            content.extend_from_slice(RULE.as_bytes());
            content.extend_from_slice(format!("\n End of COG {cog} log\n").as_bytes());
            content.extend_from_slice(RULE.as_bytes());
            content.push(b'\n');
            std::fs::write(&path, content)?;
            written.push(path);
        }
        Ok(written)
    }
}

impl Default for CogLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for CogLog {
    fn name(&self) -> &'static str {
        "cog-log"
    }

    async fn deliver(&self, msg: MessageHandle) -> anyhow::Result<()> {
        let Some(cog) = msg.kind().and_then(|k| k.cog_index()) else {
            return Ok(());
        };
        let mut buffers = self.buffers.lock().unwrap();
        let buf = &mut buffers[cog as usize];
        let now = Utc::now();
        if buf.first_at.is_none() {
            buf.first_at = Some(now);
        }
        buf.last_at = Some(now);
        buf.count += 1;
        buf.bytes.extend_from_slice(msg.data());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::MessageKind;
    use crate::metrics::Metrics;
    use crate::pool::MessagePool;
    use std::sync::Arc;

    async fn deliver(log: &CogLog, pool: &Arc<MessagePool>, kind: MessageKind, data: &[u8]) {
        let id = pool.acquire(data, kind, 0, 1).unwrap();
        log.deliver(MessageHandle::new(Arc::clone(pool), id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn export_writes_only_active_cogs() {
        let pool = Arc::new(
            MessagePool::new(8, 8, 1, 256, Arc::new(Metrics::new())).unwrap(),
        );
        let log = CogLog::new();
        deliver(&log, &pool, MessageKind::CogMessage { cog: 3 }, b"Cog3 a\n").await;
        deliver(&log, &pool, MessageKind::CogMessage { cog: 3 }, b"Cog3 b\n").await;
        deliver(&log, &pool, MessageKind::SystemInit, b"Cog0 INIT ...\n").await;
        assert_eq!(log.message_count(3), 2);
        assert_eq!(log.message_count(0), 1);
        assert_eq!(log.message_count(5), 0);

        let dir = tempfile::tempdir().unwrap();
        let main_log = dir.path().join("debug.log");
        let written = log.export(&main_log).unwrap();
        assert_eq!(written.len(), 2);
        assert!(dir.path().join("debug-cog0.log").exists());
        assert!(dir.path().join("debug-cog3.log").exists());
        assert!(!dir.path().join("debug-cog5.log").exists());

        let content = std::fs::read_to_string(dir.path().join("debug-cog3.log")).unwrap();
        assert!(content.contains(" COG 3 log"));
        assert!(content.contains(" Main log: debug.log"));
        assert!(content.contains(" Messages: 2"));
        assert!(content.contains("Cog3 a\nCog3 b\n"));
        assert!(content.contains(" End of COG 3 log"));
    }

    #[tokio::test]
    async fn non_cog_messages_are_ignored() {
        let pool = Arc::new(
            MessagePool::new(4, 4, 1, 256, Arc::new(Metrics::new())).unwrap(),
        );
        let log = CogLog::new();
        deliver(&log, &pool, MessageKind::TerminalOutput, b"plain\n").await;
        for cog in 0..COG_COUNT {
            assert_eq!(log.message_count(cog), 0);
        }
    }
}

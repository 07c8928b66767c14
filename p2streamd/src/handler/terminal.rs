use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::pool::MessageHandle;
use crate::router::Destination;

/// The shared log: every text-bearing message appended verbatim.
pub struct TerminalLog {
    file: Arc<Mutex<tokio::fs::File>>,
}

impl TerminalLog {
    pub async fn new(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }
}

#[async_trait]
impl Destination for TerminalLog {
    fn name(&self) -> &'static str {
        "terminal-log"
    }

    async fn deliver(&self, msg: MessageHandle) -> anyhow::Result<()> {
        let data = msg.data().to_vec();
        let mut f = self.file.lock().await;
        f.write_all(&data).await?;
        Ok(())
    }
}

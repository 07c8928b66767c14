use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::pool::MessageHandle;
use crate::router::Destination;

/// Forwards window-command strings to the window layer. Rendering is not
/// this pipeline's business; whoever owns the receiver draws.
pub struct WindowFeed {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl WindowFeed {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Destination for WindowFeed {
    fn name(&self) -> &'static str {
        "window-feed"
    }

    async fn deliver(&self, msg: MessageHandle) -> anyhow::Result<()> {
        let bytes = Bytes::copy_from_slice(msg.data());
        // A closed receiver just means no windows are open.
        let _ = self.tx.send(bytes);
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

    #[tokio::test]
    async fn forwards_command_with_backtick_and_newline() {
        let pool = Arc::new(
            MessagePool::new(2, 2, 1, 256, Arc::new(Metrics::new())).unwrap(),
        );
        let (feed, mut rx) = WindowFeed::new();
        let id = pool
            .acquire(b"`plot 1 2 3\n", MessageKind::WindowCommand, 0, 1)
            .unwrap();
        feed.deliver(MessageHandle::new(Arc::clone(&pool), id))
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().as_ref(), b"`plot 1 2 3\n");
        assert_eq!(pool.stats().in_use, 0);
    }
}

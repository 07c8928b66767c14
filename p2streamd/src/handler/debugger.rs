use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::classify::MessageKind;
use crate::datamgr::DataManager;
use crate::pool::MessageHandle;
use crate::protocol::{Outcome, ProtocolEngine};
use crate::router::Destination;

/// Hands binary debugger records to the protocol engine and folds the
/// results into the device-state cache.
pub struct DebuggerFeed {
    engine: Arc<Mutex<ProtocolEngine>>,
    datamgr: Arc<Mutex<DataManager>>,
}

impl DebuggerFeed {
    pub fn new(engine: Arc<Mutex<ProtocolEngine>>, datamgr: Arc<Mutex<DataManager>>) -> Self {
        Self { engine, datamgr }
    }
}

#[async_trait]
impl Destination for DebuggerFeed {
    fn name(&self) -> &'static str {
        "debugger-feed"
    }

    async fn deliver(&self, msg: MessageHandle) -> anyhow::Result<()> {
        let Some(kind) = msg.kind() else {
            return Ok(());
        };
        match kind {
            MessageKind::DbPacket => {
                let result = self.engine.lock().unwrap().on_db_packet(msg.data());
                if let Some((request, Outcome::Data(response))) = result {
                    if DataManager::command_kind(request.command).is_some() {
                        self.datamgr.lock().unwrap().on_block_data(&response);
                    }
                }
            }
            MessageKind::DebuggerFrame => {
                let snapshot = self.engine.lock().unwrap().on_snapshot(msg.data());
                if let Some(snapshot) = snapshot {
                    self.datamgr.lock().unwrap().on_snapshot(&snapshot);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{SnapshotGate, DEBUGGER_FRAME_LEN};
    use crate::events::EventBus;
    use crate::metrics::Metrics;
    use crate::pool::MessagePool;
    use crate::protocol::ActivityTracker;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn snapshot_message_populates_the_cache() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Mutex::new(ProtocolEngine::new(
            tx,
            SnapshotGate::new(),
            Arc::new(ActivityTracker::new()),
            Arc::new(Metrics::new()),
            EventBus::new(16),
        )));
        let datamgr = Arc::new(Mutex::new(DataManager::new()));
        let feed = DebuggerFeed::new(Arc::clone(&engine), Arc::clone(&datamgr));

        let pool = Arc::new(
            MessagePool::new(2, 2, 1, 1024, Arc::new(Metrics::new())).unwrap(),
        );
        let mut frame = vec![0u8; DEBUGGER_FRAME_LEN];
        frame[0] = 6; // cog
        let id = pool
            .acquire(&frame, MessageKind::DebuggerFrame, 0, 1)
            .unwrap();
        feed.deliver(MessageHandle::new(Arc::clone(&pool), id))
            .await
            .unwrap();
        assert!(datamgr.lock().unwrap().cog(6).unwrap().active);
        assert!(datamgr.lock().unwrap().scheduled_count() > 0);
    }
}

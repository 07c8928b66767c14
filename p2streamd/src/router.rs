//! Typed message routing.
//!
//! Destinations register per message kind; routing restamps the slot's
//! share count to the destination count and hands each destination its own
//! RAII share. Delivery order within a kind follows registration order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use crate::classify::MessageKind;
use crate::events::{EventBus, PipelineEvent};
use crate::metrics::Metrics;
use crate::pool::{MessageHandle, MessagePool, PoolId};

/// A registered consumer of classified messages.
///
/// The share handed to `deliver` is released when the handle drops, so a
/// destination releases exactly once whether it succeeds, fails, or stashes
/// the handle for asynchronous completion.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, msg: MessageHandle) -> anyhow::Result<()>;
}

/// Routing key: kinds collapse to their discriminant so that every COG
/// message shares one destination list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKey {
    DbPacket,
    DebuggerFrame,
    SystemInit,
    CogMessage,
    WindowCommand,
    TerminalOutput,
}

impl From<MessageKind> for RouteKey {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::DbPacket => RouteKey::DbPacket,
            MessageKind::DebuggerFrame => RouteKey::DebuggerFrame,
            MessageKind::SystemInit => RouteKey::SystemInit,
            MessageKind::CogMessage { .. } => RouteKey::CogMessage,
            MessageKind::WindowCommand => RouteKey::WindowCommand,
            MessageKind::TerminalOutput => RouteKey::TerminalOutput,
        }
    }
}

pub struct Router {
    pool: Arc<MessagePool>,
    metrics: Arc<Metrics>,
    events: EventBus,
    routes: HashMap<RouteKey, Vec<Arc<dyn Destination>>>,
}

impl Router {
    pub fn new(pool: Arc<MessagePool>, metrics: Arc<Metrics>, events: EventBus) -> Self {
        Self {
            pool,
            metrics,
            events,
            routes: HashMap::new(),
        }
    }

    pub fn register(&mut self, key: RouteKey, destination: Arc<dyn Destination>) {
        self.routes.entry(key).or_default().push(destination);
    }

    pub fn unregister(&mut self, key: RouteKey, name: &str) {
        if let Some(list) = self.routes.get_mut(&key) {
            list.retain(|d| d.name() != name);
        }
    }

    pub fn destination_count(&self, key: RouteKey) -> usize {
        self.routes.get(&key).map_or(0, Vec::len)
    }

    /// Deliver one pool slot to every destination registered for its kind.
    pub async fn route(&self, id: PoolId) {
        let Some(kind) = self.pool.get_kind(id) else {
            // Stale id; the pool already counted it.
            return;
        };
        self.announce(id, kind);
        let list = match self.routes.get(&RouteKey::from(kind)) {
            Some(list) if !list.is_empty() => list,
            _ => {
                // Nobody wants it; drop the extractor's share.
                self.pool.release(id);
                return;
            }
        };
        // Fan out: ownership transfers to the destinations, one share each.
        self.pool.set_refs(id, list.len() as u32);
        for dest in list {
            let handle = MessageHandle::new(Arc::clone(&self.pool), id);
            if let Err(err) = dest.deliver(handle).await {
                self.metrics.inc_routing_error();
                log::warn!("destination {} failed: {err:#}", dest.name());
            }
        }
    }

    fn announce(&self, id: PoolId, kind: MessageKind) {
        match kind {
            MessageKind::SystemInit => {
                let text = self
                    .pool
                    .get(id)
                    .map(|v| String::from_utf8_lossy(v.data).into_owned())
                    .unwrap_or_default();
                self.events.emit(PipelineEvent::SystemReboot {
                    text,
                    timestamp: Utc::now(),
                });
            }
            MessageKind::DbPacket | MessageKind::DebuggerFrame => {
                let bytes = self
                    .pool
                    .get(id)
                    .map(|v| Bytes::copy_from_slice(v.data))
                    .unwrap_or_default();
                self.events.emit(PipelineEvent::DebuggerPacket { bytes });
            }
            _ => {}
        }
    }
}

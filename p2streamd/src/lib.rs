pub mod classify;
pub mod config;
pub mod datamgr;
pub mod emergency;
pub mod events;
pub mod extract;
pub mod handler;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod recording;
pub mod ring;
pub mod router;
pub mod watchdog;

pub use classify::MessageKind;
pub use config::Config;
pub use events::{EventBus, PipelineEvent};
pub use metrics::Metrics;
pub use pipeline::{Pipeline, PipelineHandle};
pub use router::{Destination, RouteKey};

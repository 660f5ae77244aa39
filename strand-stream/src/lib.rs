//! Streaming layer: fans session events out to websocket and SSE subscribers
//! and accepts remotely triggered tasks.

pub mod broadcaster;
pub mod handlers;
pub mod router;
pub mod state;
pub mod types;

pub use broadcaster::{Broadcaster, ChannelSubscriber, DeliveryError, Subscriber, SubscriberId};
pub use router::stream_router;
pub use state::{SessionRunner, StreamState};
pub use types::{
    ConfirmRequest, ConfirmResponse, ErrorResponse, HealthResponse, TaskAccepted, TaskRequest,
};

pub mod controller;
pub mod display;
pub mod inbound;
pub mod snapshot;
pub mod state;
pub mod stdin_feed;
pub mod viewport;

pub use controller::{LivenessTracker, RegistryHandle};
pub use display::{ChannelDisplaySink, DisplayCommand, DisplaySink, ListEntry, LogDisplaySink};
pub use inbound::{normalize_event, parse_timestamp, InboundEvent, ParsedTimestamp, TimestampSource};
pub use snapshot::{EntityRecord, SnapshotSource, SnapshotStore};
pub use state::{Effect, Registry};
pub use stdin_feed::spawn_stdin_feed;
pub use viewport::{plan_viewport, PositionSource, ViewportController, ViewportReason};

pub mod connectivity;
pub mod controller;
pub mod http_sink;
pub mod queue;
pub mod sampler;
pub mod stdin_provider;
pub mod uplink;

pub use connectivity::{ConnectivityWatcher, DrainTarget, ReachabilityEvent, ReachabilityProbe};
pub use controller::{ProducerController, ProducerStatus};
pub use http_sink::HttpSink;
pub use queue::{Delivery, DurableQueue};
pub use sampler::{Fix, PositionProvider, Sampler};
pub use stdin_provider::StdinPositionProvider;
pub use uplink::{RemoteSink, RetryPolicy, Uplink};

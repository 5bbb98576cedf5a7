pub mod client;
pub mod messages;
pub mod ws;

pub use client::{
    BackendApi, ClientFactory, HttpBackendClient, HttpClientFactory, QueueSnapshot, RawResponse,
    SubmitResponse,
};
pub use messages::{parse_message, Terminal, UpstreamMessage};
pub use ws::{run_event_stream, BackoffConfig, EventStreamConfig, UpstreamFrame};

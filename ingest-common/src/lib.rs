pub mod batch;
pub mod capability;
pub mod client;
pub mod config;
pub mod enrich;
pub mod envelope;
pub mod error;
pub mod model_router;
pub mod notify;
pub mod pgqueue;
pub mod pipeline;
pub mod processors;
pub mod prometheus;
pub mod queue;
pub mod response;
pub mod retry;
pub mod schema;
pub mod sinks;
pub mod status;
pub mod store;
pub mod test_utils;
pub mod time;

pub mod api;
pub mod connection;
pub mod metrics;
pub mod orderbook;
pub mod pipeline;
pub mod protocol;
pub mod tape;
pub mod types;

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod document;
pub mod messages;
pub mod ot;
pub mod presence;
pub mod server;
pub mod store;

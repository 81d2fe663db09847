//! [`batter::SearchEngine`] over an Elasticsearch-compatible REST API.

pub mod client;
pub mod config;
pub mod wire;

pub use client::HttpEngine;
pub use config::EngineConfig;

// Library root — exposes internals for integration tests and future crate
// consumers. The binary entry point is src/main.rs.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod generator;
pub mod logger;
pub mod monitor;
pub mod persist;
pub mod pipeline;
pub mod record;
pub mod retriever;
pub mod scheduler;
pub mod service;

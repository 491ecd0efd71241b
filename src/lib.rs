pub mod aggregates;
pub mod config;
pub mod constants;
pub mod error;
pub mod indexer;
pub mod store;
pub mod types;

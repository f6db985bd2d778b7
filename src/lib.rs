pub mod app;
pub mod config;
pub mod domain;
pub mod ena;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod report;
pub mod resequencer;
pub mod sink;
pub mod store;

pub mod aggregator;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod media;
pub mod telegram;

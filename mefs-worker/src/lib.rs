pub mod config;
pub mod context;
pub mod keys;
pub mod metrics;
pub mod proposal;

pub mod breaker;
pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod errors;
pub mod executor;
pub mod monitor;
pub mod operation;
pub mod phase;
pub mod plan;
pub mod retry;
pub mod ui;

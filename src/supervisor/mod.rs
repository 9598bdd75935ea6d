//! Supervisor module
//!
//! Owns the pool of concurrent worker loops: spawning them up to the
//! desired count, stopping the excess cooperatively, applying live
//! configuration changes, and rolling their state up into an
//! operator-facing status.

mod crawl_loop;
mod service;

pub use crawl_loop::{CrawlLoop, LoopContext, LoopState, STOP_SENTINEL_MS};
pub use service::{
    CrawlerSupervisor, LoopInfo, Reconfigurable, SystemStatus,
};

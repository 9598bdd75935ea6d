//! graph-herder - Distributed crawler flow control
//!
//! The resource-governance layer of a distributed crawler for a
//! rate-limited entity API. Many worker processes run concurrently
//! against shared queues and a shared pool of API credentials; this
//! crate decides which unit of work runs next, whether it is safe to run
//! at all, which credential to use, and how many concurrent workers
//! should exist.
//!
//! # Architecture
//!
//! - Weighted priority queues feed supervised worker loops
//! - A short-window attenuation cache and a cluster-wide request
//!   tracker give each queue exactly-once-ish delivery semantics
//! - Credentials carry capability traits, get benched when the upstream
//!   caps them, and sit behind an independent per-process call-rate cap
//! - A compute budget charges only the surprising excess of each call's
//!   cost, against a self-calibrating baseline
//!
//! # Scaling
//!
//! Run more processes pointed at the same Redis: queues, locks, tags,
//! and rate windows are all shared, so the cluster converges on one
//! admission decision per unit of work per tracking window.

pub mod config;
pub mod error;
pub mod limiter;
pub mod lock;
pub mod processor;
pub mod providers;
pub mod queue;
pub mod request;
pub mod supervisor;
pub mod token;
pub mod tracker;

pub use error::{HerderError, Result};
pub use request::{Disposition, Request};

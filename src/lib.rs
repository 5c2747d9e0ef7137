//! Floodgate - Windowed Request Rate Limiting
//!
//! This crate implements a per-key request quota over a fixed,
//! reset-on-expiry time window. Counting runs against a shared Redis store
//! when one is configured and reachable, and against an isolated
//! in-process map otherwise. Backend failures never block a request: the
//! limiter fails open and retries the store after a cooldown.

pub mod clock;
pub mod config;
pub mod error;
pub mod hook;
pub mod limit;

pub use config::{KeyStrategy, LimiterConfig};
pub use error::{FloodgateError, Result};
pub use limit::{Decision, RequestLimiter};

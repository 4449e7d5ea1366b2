//! Event-driven query cache for the courier platform.
//!
//! See [`cache`] for the subsystem itself; [`config`], [`infra`] and
//! [`replay`] support the diagnostics binary.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod replay;

//! Incremental static regeneration response cache.
//!
//! [`cache`] holds the store, revalidation handler and axum middleware;
//! [`config`] and [`infra`] provide settings and logging for the binary.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;

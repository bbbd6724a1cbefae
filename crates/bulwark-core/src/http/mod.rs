//! HTTP transport for the resilience pipeline.

mod client;

pub use client::{extract_domain, HttpFetcher};

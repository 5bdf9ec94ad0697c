//! Lead Dispatch Engine Library
//!
//! Pushes batches of leads to a rate-limited outbound platform under bounded
//! concurrency with retry and backoff, and serves enriched, cached campaign
//! analytics for the dashboard.
//!
//! # Modules
//!
//! - `audit`: Batch outcome recorders (Postgres, tracing).
//! - `cache`: Two-tier TTL cache (moka + durable store).
//! - `cache_validator`: Checksum envelope for durable cache entries.
//! - `circuit_breaker`: Circuit breaker for audit writes.
//! - `config`: Configuration management.
//! - `db`: Database connection pool.
//! - `destination`: Destination and analytics source traits.
//! - `dispatcher`: Batch fan-out with per-item isolation.
//! - `engine`: Facade over the write and read paths.
//! - `enrichment`: Campaign enrichment pipeline.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `leads`: Lead validation and de-duplication.
//! - `limiter`: Per-destination concurrency limiter.
//! - `models`: Core data models.
//! - `platform_client`: HTTP client for the outbound platform.
//! - `rate_limit`: Destination rate-limit window tracking.
//! - `reporter`: Batch summaries.
//! - `retry`: Retry executor with exponential backoff.

pub mod audit;
pub mod cache;
pub mod cache_validator;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod destination;
pub mod dispatcher;
pub mod engine;
pub mod enrichment;
pub mod errors;
pub mod handlers;
pub mod leads;
pub mod limiter;
pub mod models;
pub mod platform_client;
pub mod rate_limit;
pub mod reporter;
pub mod retry;

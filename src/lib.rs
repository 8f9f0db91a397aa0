//! Headlines - a cached news headline aggregator
//!
//! This crate fetches a fixed set of RSS/Atom feeds concurrently, merges their
//! entries into one deduplicated newest-first list, and serves it as JSON from
//! a time-bounded cache.

pub mod aggregator;
pub mod cache;
pub mod config;
pub mod fetcher;
pub mod model;
pub mod normalize;
pub mod routes;

//! Testing utilities for rundex.
//!
//! Provides [`MockAdapter`], a configurable in-memory source adapter for
//! exercising the engine without real backends: scripted corpora, scripted
//! per-pass inventories for change-detection tests, injectable failures and
//! latency, and call counting.

mod mock_adapter;

pub use mock_adapter::{MockAdapter, MockAdapterBuilder};

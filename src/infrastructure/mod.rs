//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `broker`: broker driver boundary plus in-memory and Redis Streams drivers
//! - `config`: Application configuration and settings
//! - `error`: Unified error types
//! - `metrics`: `MetricsCollector` contract and Prometheus collector

pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;

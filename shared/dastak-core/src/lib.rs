//! Dastak Core - Shared domain types and service infrastructure
//!
//! This crate provides:
//! - Standard service trait the comms services implement
//! - Common domain types (order/party views, phone numbers, purposes)
//! - Error handling utilities
//! - Configuration helpers

pub mod config;
pub mod domain;
pub mod error;
pub mod service;

pub use domain::*;
pub use error::{CommsError, Result};
pub use service::{CommsService, DependencyStatus, HealthStatus, ReadinessStatus, ServiceRuntime};

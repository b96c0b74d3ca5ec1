//! Proxy module for describing and checking proxies
//!
//! This module provides functionality for:
//! - Parsing proxy list lines into descriptors (HOST:PORT, USER:PASS@HOST:PORT, etc.)
//! - Probing a proxy for liveness and its exit address
//! - Resolving an exit address to a country

pub mod checker;
pub mod geo;
pub mod models;
pub mod parser;

pub use checker::{CheckerConfig, HealthChecker, HttpHealthChecker};
pub use geo::{GeoLocator, GeoResolver, NoGeo, UNKNOWN_COUNTRY};
pub use models::{ProbeOutcome, ProxyAuth, ProxyDescriptor, ProxyType};
pub use parser::{ParsedList, ProxyParser};

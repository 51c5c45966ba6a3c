//! Locate GCP instances, managed instance groups and IP address owners, and
//! search resources across projects.

pub mod cache;
pub mod config;
pub mod error;
pub mod gcp;
pub mod iplookup;
pub mod progress;
pub mod resolve;
pub mod search;
pub mod shell;

pub use error::{Error, Result};

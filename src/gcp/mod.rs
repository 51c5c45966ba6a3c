//! GCP API interaction module
//!
//! # Module Structure
//!
//! - [`auth`] - Access tokens and default project discovery
//! - [`client`] - Project-scoped REST client and URL builders
//! - [`http`] - HTTP calls and the [`http::ApiError`] type
//! - [`pager`] - Continuation-token pagination
//! - [`compute`] - Compute Engine models and the [`compute::ComputeApi`] directory trait
//! - [`projects`] - Project listing

pub mod auth;
pub mod client;
pub mod compute;
#[cfg(test)]
pub(crate) mod fake;
pub mod http;
pub mod pager;
pub mod projects;

//! # SkyPortal Rust Backend
//!
//! Ingests GCN alerts, stores their sky localizations as HEALPix range tiles
//! and dispatches follow-up observation requests to telescope facilities.
//!
//! ## Architecture
//!
//! - [`models`]: GCN events and notices, VOEvent parsing, HEALPix geometry,
//!   skymaps and follow-up requests
//! - [`api`]: Identifier types and the domain types exchanged over REST
//! - [`db`]: Repository traits with in-memory and PostgreSQL backends
//! - [`services`]: Ingest, tiling and contour jobs, cross-match queries and
//!   the follow-up request lifecycle
//! - [`facility`]: Clients for the facility schedulers (KPED, JSON queue)
//! - [`config`]: TOML configuration with environment overrides
//! - [`http`]: Axum-based HTTP server and request handlers

// RepositoryError carries an ErrorContext.
#![allow(clippy::result_large_err)]

pub mod api;
pub mod config;
pub mod db;
pub mod facility;
pub mod models;
pub mod services;

#[cfg(feature = "http-server")]
pub mod http;

//! Crate root: public surface of the freva-rest gateway.
//!
//! The gateway sits between HTTP clients (CLIs, notebooks, browsers) and
//! three back ends: a Solr search index holding per-file climate metadata, a
//! document store for statistics and user-owned flavour definitions, and a
//! cache/broker through which a data-loading worker streams Zarr chunks.
//!
//! ## Invariants
//!
//! - **Canonical vocabulary.** Every query and every stored document uses
//!   the canonical field set from [`flavour::CANONICAL_FIELDS`]; named
//!   vocabularies ("flavours") are injective partial renamings applied at
//!   the HTTP boundary, inbound and outbound.
//! - **Streaming discipline.** Search results are pulled from the backend
//!   page by page and handed to the client as they arrive; dropping the
//!   response body stops the pulling. Headers commit before the first byte.
//! - **Linearisable jobs.** A Zarr conversion token is a deterministic
//!   UUIDv5 of `(requester, paths, options)`; job creation is
//!   set-if-not-exists in the cache, so identical requests collapse onto one
//!   job.
//! - **Stateless shares.** Share URLs carry an HMAC over
//!   `method|token|expires`; verification is a pure function of the server
//!   secret, the URL components and the clock.
//! - **No lock across I/O.** The three process-wide caches (JWKS, flavour
//!   snapshot, configuration) are read-mostly snapshots swapped atomically.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// OIDC mediation: discovery, code/device flows, token validation.
pub mod auth;
/// Cache/broker client (Redis over its REST endpoint).
pub mod cache;
/// Environment/TOML configuration snapshot.
pub mod config;
/// Document store client for statistics and user flavours.
pub mod docstore;
/// Crate-wide error kinds and their HTTP mapping.
pub mod error;
/// Canonical fields, built-in and user-defined vocabularies.
pub mod flavour;
/// Intake-ESM catalogue synthesis.
pub mod intake;
/// Facet/time/bbox query syntax and Solr fragment rendering.
pub mod query;
/// The search engine adapter.
pub mod search;
/// Low-level Solr client.
pub mod solr;
/// STAC 1.1.0 synthesis and pagination tokens.
pub mod stac;
/// Bounded statistics queue.
pub mod stats;
/// Zarr conversion broker and share layer.
pub mod zarr;
/// HTTP surface: routers and handlers.
pub mod api;

pub use crate::auth::Principal;
pub use crate::config::Settings;
pub use crate::error::{ApiError, ApiResult};

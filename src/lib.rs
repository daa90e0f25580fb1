//! Mirrorgate - a rewriting mirror proxy
//!
//! This library serves content fetched from origin sites under other
//! domains:
//! - Resolves the mirrored site from the Host header, subdomains included
//! - Fetches from the origin through a pool of clients bound to the host's
//!   public addresses
//! - Rewrites HTML, CSS and JS so every link and host reference points at
//!   the mirror, then resolves placeholder tags in a single template pass
//! - Caches decoded origin responses on disk and falls back to stale entries
//!   when the origin is down
//! - Blocks search crawlers that are not allow-listed

pub mod auth;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod content;
pub mod context;
pub mod convert;
pub mod crawler;
pub mod error;
pub mod page;
pub mod pool;
pub mod proxy;
pub mod rewrite;
pub mod site;
pub mod template;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

//! Authoritative DNS with caching and in-process referral walking.

pub mod cache;
pub mod record;
pub mod resolver;
pub mod server;
pub mod store;
pub mod wire;

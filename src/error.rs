//! Error types shared across the resolver and lease engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. Negative DNS answers (NXDOMAIN,
//! SERVFAIL) are *not* errors; they are terminal resolution outcomes and
//! live in [`Resolution`](crate::dns::resolver::Resolution).

use std::net::Ipv4Addr;

/// Errors that can occur while serving DNS queries or DHCP exchanges.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config file).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed wire message (DNS or DHCP).
    ///
    /// Covers packets that are too short, carry an invalid magic cookie,
    /// have truncated options, compression-pointer loops, or other
    /// protocol violations. The offending packet is dropped, never
    /// answered with garbage.
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// The lease pool has no allocatable address left.
    #[error("No available address in pool")]
    PoolExhausted,

    /// Lost the commit race for an address.
    ///
    /// Another transaction committed the address first. The losing client
    /// is NAKed and must restart DISCOVER.
    #[error("Address {0} was claimed by another transaction")]
    Conflict(Ipv4Addr),

    /// Requested IP address is outside the pool range or excluded.
    #[error("Address {0} is outside the configured pool range")]
    AddressOutOfRange(Ipv4Addr),

    /// No lease exists for the specified address or client.
    #[error("No lease found for {0}")]
    LeaseNotFound(String),

    /// Zone data failed validation; the previous snapshot stays active.
    #[error("Invalid zone data for {zone}: {reason}")]
    ZoneData { zone: String, reason: String },

    /// Relay or upstream endpoint did not answer within the attempt budget.
    #[error("Timed out after {attempts} attempt(s): {message}")]
    Timeout { message: String, attempts: u32 },

    /// Invalid server configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g., range_start > range_end).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to a privileged port without
    /// administrator rights.
    #[error("Socket error: {0}")]
    Socket(String),
}

/// A specialized Result type for resolver and lease operations.
pub type Result<T> = std::result::Result<T, Error>;

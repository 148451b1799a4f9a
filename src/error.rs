//! Error types for the DHCP server.
//!
//! All fallible operations in this crate return [`Result<T>`]. The variants
//! fall into two groups: per-message conditions raised by the lease engine
//! (configuration, exhaustion, mismatch, store failures) and the plumbing
//! errors of the wire codec and socket layer.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::mac::MacAddress;

/// Errors that can occur during DHCP server operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error outside the lease store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or lease files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP packet received.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// The client's pool cannot be determined, or a range, option or
    /// configuration value is malformed.
    ///
    /// Raised per message; the server keeps running.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Every address in the client's pool is held by another client.
    #[error("No available IP addresses in pool")]
    PoolExhausted,

    /// A client asked to confirm an address that is not owed to it.
    ///
    /// The REQUEST path answers this with a NAK.
    #[error("Address {ip} is not leased to {mac}{}", held_by(.holder))]
    LeaseMismatch {
        ip: Ipv4Addr,
        mac: MacAddress,
        holder: Option<MacAddress>,
    },

    /// The lease file could not be written or read.
    ///
    /// The in-memory lease tables are left untouched when this is returned
    /// from a mutating store operation.
    #[error("Lease store I/O error on {}: {source}", .path.display())]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A store update would break the one-lease-per-MAC / one-lease-per-IP
    /// invariant. Always a caller bug.
    #[error("Lease store invariant violated: {0}")]
    StoreConsistency(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges,
    /// or when the specified network interface doesn't exist.
    #[error("Socket error: {0}")]
    Socket(String),
}

fn held_by(holder: &Option<MacAddress>) -> String {
    holder
        .map(|holder| format!(" (held by {holder})"))
        .unwrap_or_default()
}

/// A specialized Result type for DHCP operations.
pub type Result<T> = std::result::Result<T, Error>;

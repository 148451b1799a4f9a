//! # dhcpchain
//!
//! A DHCP server core (RFC 2131) whose per-client options come from an
//! ordered chain of backends.
//!
//! ## Features
//!
//! - DISCOVER, REQUEST, DECLINE, RELEASE and INFORM handling
//! - Dynamic allocation from `ip_range` pools, with sticky and requested addresses
//! - Static assignments supplied by a backend (`yiaddr`)
//! - Backend chain merged last-writer-wins: static tables, per-MAC option
//!   directories, no-op
//! - Leases persisted to a JSON file that is rewritten atomically
//! - Relay agent support (giaddr and Option 82)
//!
//! ## Quick Start
//!
//! ```no_run
//! use dhcpchain::{Config, DhcpServer};
//!
//! #[tokio::main]
//! async fn main() -> dhcpchain::Result<()> {
//!     let config = Config::load_or_create("config.json").await?;
//!     let mut server = DhcpServer::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`DhcpServer`] - UDP receive loop on port 67
//! - [`ProtocolHandler`] - one request in, at most one [`Reply`] out
//! - [`LeaseAllocator`] - address selection on top of a [`LeaseStore`]
//! - [`BackendChain`] - ordered [`OptionProvider`]s
//! - [`AddressRangeCollection`] - allocation pools
//! - [`DhcpPacket`] / [`DhcpOption`] - wire codec

pub mod backend;
pub mod config;
pub mod error;
pub mod handler;
pub mod lease;
pub mod mac;
pub mod options;
pub mod packet;
pub mod range;
pub mod server;
pub mod store;

pub use backend::{BackendChain, OptionMap, OptionProvider};
pub use config::{BackendConfig, Config};
pub use error::{Error, Result};
pub use handler::{ProtocolHandler, Reply};
pub use lease::{Lease, LeaseAllocator, LeaseState};
pub use mac::MacAddress;
pub use options::{DhcpOption, MessageType};
pub use packet::DhcpPacket;
pub use range::{AddressRange, AddressRangeCollection};
pub use server::DhcpServer;
pub use store::LeaseStore;

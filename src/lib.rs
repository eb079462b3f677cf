//! Sluice
//!
//! Exposes a local service listening on a Unix socket or TCP address
//! through a relay. A [`client::Session`] keeps one authenticated control
//! connection to the relay, registers TCP endpoints on it, and receives
//! every public connection as a multiplexed stream that is forwarded to the
//! local destination.
//!
//! The crate also ships the development [`relay`] the client talks to and a
//! tiny [`hello`] HTTP service used by the default `sluice tcp` flow.

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

pub mod acl;
pub mod client;
pub mod config;
pub mod error;
pub mod hello;
pub mod mux;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use client::{Destination, Session, SessionBuilder, Tunnel};
pub use error::{Result, SluiceError};
pub use hello::HelloServer;
pub use relay::{RelayConfig, RelayServer};

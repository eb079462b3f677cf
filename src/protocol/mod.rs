//! Protocol frame types for the control connection.
//!
//! Defines the JSON frame format exchanged between client and relay:
//! - [`Frame`] - every message on the control connection, tagged by `type`
//! - [`EndpointOptions`] - what a client asks for when it opens an endpoint
//!
//! Also provides type-safe ID wrappers for compile-time safety.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;

//! Tunnel client implementation.
//!
//! This module provides the client half of a tunnel:
//! - [`Session`] - authenticated control connection with reconnects
//! - [`TcpEndpointBuilder`] / [`Tunnel`] - endpoint registration
//! - [`forward_stream`] - local forwarder to a pipe or TCP address
//! - [`pipe_name`] - fresh local socket paths

mod endpoint;
mod forward;
mod pipe;
pub mod proxy_proto;
mod session;
mod status;

pub use endpoint::{TcpEndpointBuilder, Tunnel, TunnelInfo};
pub use forward::{forward_stream, Destination};
pub use pipe::pipe_name;
pub use session::{server_url, Session, SessionBuilder, AUTHTOKEN_ENV, DEFAULT_SERVER};
pub use status::ConnectionStatus;

//! Command/response channel to the SXM host control software.
//!
//! - [`codec`]: program encoding and reply parsing
//! - [`transport`]: the [`HostTransport`] trait and the line-framed stream
//!   transport
//! - [`client`]: [`ProtocolClient`], the serialized request/response session
//! - [`mock`]: in-process simulated host

pub mod client;
pub mod codec;
pub mod mock;
pub mod transport;

pub use client::{Ack, ConnectOptions, HostEndpoint, ProtocolClient};
pub use codec::{HostCommand, HostReply};
pub use mock::{MockFault, MockHost, MockHostHandle};
pub use transport::{connect_tcp, HostTransport, StreamTransport, TransportError};

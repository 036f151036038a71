//! Pooled connection core for a binary key-value cache protocol.
//!
//! This crate is the node/transport concurrency layer of a cache client:
//! per-node connection pools, per-connection transports with a dedicated
//! receive loop and FIFO request/response correlation, an authentication
//! handshake gating each fresh connection, and replica fan-out on top.
//! Command serialization, key placement and the request type hierarchy are
//! external collaborators reached through the narrow seams in [`request`],
//! [`config`] and [`dispatcher`].

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod headers;
pub mod node;
pub mod request;
pub mod transport;

pub use auth::{AuthStatus, AuthenticationToken, Authenticator, PlainTextAuthenticator};
pub use config::{ClientConfiguration, DisposeGuard, NodeFactory, TransportFactory};
pub use dispatcher::{NodeLocator, ReplicaDispatcher, ReplicaPolicy, SequentialLocator};
pub use error::{ConfigError, TransportError};
pub use headers::{
    write_request_header, ResponseHeader, Status, REQUEST_MAGIC, RESPONSE_HEADER_LEN,
    RESPONSE_MAGIC,
};
pub use node::{CacheNode, NodeCallbacks, NodeConnectionPool};
pub use request::{CacheRequest, CompletionSlot};
pub use transport::{
    SetupAction, TcpTransport, Transport, TransportCallbacks, TransportOptions,
};

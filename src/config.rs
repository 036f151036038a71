//! Client configuration: endpoints, pool sizing, timeouts, replica policy
//! and the factory seams the tests and embedders replace.
//!
//! Factories are explicit configuration values built once at construction.
//! There is no process-wide default allocator; swapping the transport or
//! node implementation is a per-configuration decision.

use crate::auth::Authenticator;
use crate::dispatcher::{NodeLocator, ReplicaPolicy, SequentialLocator};
use crate::error::ConfigError;
use crate::node::{CacheNode, NodeCallbacks, NodeConnectionPool};
use crate::transport::{TcpTransport, Transport, TransportOptions};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builds one transport from the options the owning pool assembled.
pub type TransportFactory = Arc<dyn Fn(TransportOptions) -> Arc<dyn Transport> + Send + Sync>;

/// Builds one node pool for an endpoint.
pub type NodeFactory =
    Arc<dyn Fn(SocketAddr, &ClientConfiguration, NodeCallbacks) -> Arc<dyn CacheNode> + Send + Sync>;

/// Client-wide disposal flag shared with every node and transport, so
/// background recovery observes shutdown instead of resurrecting sockets
/// into a client that is going away.
#[derive(Clone)]
pub struct DisposeGuard {
    disposing: Arc<AtomicBool>,
}

impl Default for DisposeGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl DisposeGuard {
    pub fn new() -> Self {
        Self {
            disposing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trip(&self) {
        self.disposing.store(true, Ordering::SeqCst);
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct ClientConfiguration {
    pub endpoints: Vec<SocketAddr>,
    /// Transports per node.
    pub pool_size: usize,
    /// Per-checkout wait when borrowing a transport from a pool.
    pub send_timeout: Duration,
    /// Additional nodes each operation is redundantly delivered to.
    pub replicas: usize,
    pub replica_policy: ReplicaPolicy,
    /// Delay between recovery attempts for a dead transport. `None`
    /// disables background reconnection entirely.
    pub reconnect_delay: Option<Duration>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub locator: Arc<dyn NodeLocator>,
    pub transport_factory: TransportFactory,
    pub node_factory: NodeFactory,
    pub dispose_guard: DisposeGuard,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConfiguration {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            pool_size: 2,
            send_timeout: Duration::from_millis(500),
            replicas: 0,
            replica_policy: ReplicaPolicy::PrimaryAccepted,
            reconnect_delay: Some(Duration::from_secs(1)),
            authenticator: None,
            locator: Arc::new(SequentialLocator),
            transport_factory: Arc::new(|options: TransportOptions| {
                TcpTransport::start(options) as Arc<dyn Transport>
            }),
            node_factory: Arc::new(
                |endpoint: SocketAddr, config: &ClientConfiguration, events: NodeCallbacks| {
                    NodeConnectionPool::new(endpoint, config, events) as Arc<dyn CacheNode>
                },
            ),
            dispose_guard: DisposeGuard::new(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: Vec<SocketAddr>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_replica_policy(mut self, policy: ReplicaPolicy) -> Self {
        self.replica_policy = policy;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Option<Duration>) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_locator(mut self, locator: Arc<dyn NodeLocator>) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn with_node_factory(mut self, factory: NodeFactory) -> Self {
        self.node_factory = factory;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        Ok(())
    }
}

//! Per-endpoint connection pool and node liveness aggregation.
//!
//! A node owns a fixed-size set of transports to one endpoint. Senders check
//! one out per attempt; a transport that accepts a request stays out of
//! circulation until its response has been correlated, at which point it
//! hands itself back through the availability callback. Liveness is the
//! working-transport count folded down to a single alive/dead flag, with
//! both zero-crossing transitions serialized under the node lock so each
//! notification fires exactly once.

use crate::config::ClientConfiguration;
use crate::error::TransportError;
use crate::headers::ResponseHeader;
use crate::request::CacheRequest;
use crate::transport::{Transport, TransportCallbacks, TransportOptions};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One cache server endpoint as the dispatcher sees it.
pub trait CacheNode: Send + Sync {
    /// Attempts delivery through the pool, blocking up to `timeout` per
    /// checkout and retrying across at most pool-size transports. `false`
    /// means the request was not accepted anywhere on this node.
    fn try_send(&self, request: Arc<dyn CacheRequest>, timeout: Duration) -> bool;

    fn is_dead(&self) -> bool;

    fn endpoint(&self) -> SocketAddr;

    /// Drains and closes every pooled transport. Idempotent; sends after
    /// disposal fail cleanly.
    fn dispose(&self);
}

/// Node-level notifications surfaced to the dispatcher/client layer.
/// Fire-and-forget, invoked from transport threads; no return value is
/// expected and implementations must not block.
#[derive(Clone)]
pub struct NodeCallbacks {
    pub on_transport_error: Arc<dyn Fn(&TransportError) + Send + Sync>,
    pub on_response: Arc<dyn Fn(&ResponseHeader) + Send + Sync>,
    pub on_protocol_error: Arc<dyn Fn(&ResponseHeader) + Send + Sync>,
    pub on_node_alive: Arc<dyn Fn(SocketAddr) + Send + Sync>,
    pub on_node_dead: Arc<dyn Fn(SocketAddr) + Send + Sync>,
}

impl Default for NodeCallbacks {
    fn default() -> Self {
        Self {
            on_transport_error: Arc::new(|_| {}),
            on_response: Arc::new(|_| {}),
            on_protocol_error: Arc::new(|_| {}),
            on_node_alive: Arc::new(|_| {}),
            on_node_dead: Arc::new(|_| {}),
        }
    }
}

struct PoolState {
    available: VecDeque<Arc<dyn Transport>>,
    disposing: bool,
}

pub struct NodeConnectionPool {
    endpoint: SocketAddr,
    pool_size: usize,
    /// Count of transports currently registered as working. Incremented and
    /// decremented atomically; the zero crossings are re-checked under the
    /// state lock before flipping the node flag.
    working: AtomicUsize,
    alive: AtomicBool,
    state: Mutex<PoolState>,
    /// Doubles as the node's cancellation signal: a dead transition does a
    /// notify_all so blocked checkouts re-test the alive flag immediately
    /// instead of waiting out their timeout.
    available_cond: Condvar,
    events: NodeCallbacks,
    /// Every transport ever created for this node, kept for the node's
    /// lifetime so reconnecting transports are not dropped mid-recovery.
    roster: Mutex<Vec<Arc<dyn Transport>>>,
}

impl NodeConnectionPool {
    /// Eagerly fills the pool: creates `pool_size` transports through the
    /// configured factory and starts each one. Transports report themselves
    /// in through the availability callback as their handshakes finish.
    pub fn new(
        endpoint: SocketAddr,
        config: &ClientConfiguration,
        events: NodeCallbacks,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            endpoint,
            pool_size: config.pool_size,
            working: AtomicUsize::new(0),
            alive: AtomicBool::new(false),
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                disposing: false,
            }),
            available_cond: Condvar::new(),
            events,
            roster: Mutex::new(Vec::with_capacity(config.pool_size)),
        });
        for _ in 0..node.pool_size {
            let transport = (config.transport_factory)(node.transport_options(config));
            node.roster.lock().push(transport);
        }
        node
    }

    fn transport_options(self: &Arc<Self>, config: &ClientConfiguration) -> TransportOptions {
        TransportOptions {
            endpoint: self.endpoint,
            callbacks: self.transport_callbacks(),
            authenticator: config.authenticator.clone(),
            reconnect_delay: config.reconnect_delay,
            dispose_guard: config.dispose_guard.clone(),
        }
    }

    /// Wires a transport's lifecycle back into this pool. Error and
    /// response observations forward straight to the node-level callbacks;
    /// dead/available feed the liveness accounting.
    fn transport_callbacks(self: &Arc<Self>) -> TransportCallbacks {
        let weak = Arc::downgrade(self);
        let on_dead = {
            let weak = weak.clone();
            Arc::new(move |transport: &Arc<dyn Transport>| {
                if let Some(node) = weak.upgrade() {
                    node.transport_dead(transport);
                }
            })
        };
        let on_available = Arc::new(move |transport: &Arc<dyn Transport>| {
            if let Some(node) = weak.upgrade() {
                node.transport_available(transport.clone());
            }
        });
        TransportCallbacks {
            on_transport_error: self.events.on_transport_error.clone(),
            on_response: self.events.on_response.clone(),
            on_protocol_error: self.events.on_protocol_error.clone(),
            on_dead,
            on_available,
        }
    }

    /// A transport finished its handshake, came back from a response, or
    /// recovered. First availability after (re)registration counts it as
    /// working and may resurrect the node.
    fn transport_available(&self, transport: Arc<dyn Transport>) {
        if transport.mark_registered() {
            self.working.fetch_add(1, Ordering::SeqCst);
            if !self.alive.load(Ordering::SeqCst) {
                let guard = self.state.lock();
                let resurrected = !self.alive.swap(true, Ordering::SeqCst);
                drop(guard);
                if resurrected {
                    info!("event=node_alive endpoint={}", self.endpoint);
                    (self.events.on_node_alive)(self.endpoint);
                }
            }
        }

        let mut state = self.state.lock();
        if state.disposing {
            drop(state);
            transport.shutdown();
            return;
        }
        state.available.push_back(transport);
        drop(state);
        self.available_cond.notify_one();
    }

    /// A transport died. The last working transport going down flips the
    /// node to dead and wakes every blocked checkout.
    fn transport_dead(&self, transport: &Arc<dyn Transport>) {
        let guard = self.state.lock();
        if !transport.clear_registered() {
            return;
        }
        let remaining = self.working.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.alive.store(false, Ordering::SeqCst);
            drop(guard);
            self.available_cond.notify_all();
            warn!("event=node_dead endpoint={}", self.endpoint);
            (self.events.on_node_dead)(self.endpoint);
        }
    }

    /// Blocks for an available transport up to `timeout`, aborting early on
    /// disposal or when the node goes dead.
    fn take_available(&self, timeout: Duration) -> Option<Arc<dyn Transport>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.disposing {
                return None;
            }
            if let Some(transport) = state.available.pop_front() {
                return Some(transport);
            }
            if !self.alive.load(Ordering::SeqCst) {
                return None;
            }
            if self
                .available_cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.available.pop_front();
            }
        }
    }

    /// Number of transports currently counted as working.
    pub fn working_transports(&self) -> usize {
        self.working.load(Ordering::SeqCst)
    }

    /// Number of transports sitting in the available queue right now.
    pub fn pooled_transports(&self) -> usize {
        self.state.lock().available.len()
    }
}

impl CacheNode for NodeConnectionPool {
    fn try_send(&self, request: Arc<dyn CacheRequest>, timeout: Duration) -> bool {
        // Bounded retry: at most one attempt per pool slot, never an
        // unbounded hunt for a healthy transport.
        for _ in 0..self.pool_size {
            let Some(transport) = self.take_available(timeout) else {
                return false;
            };
            if transport.try_send(request.clone()) {
                // Accepted: the transport self-returns once the response is
                // correlated, so it is deliberately not re-pooled here.
                return true;
            }
            debug!(
                "event=pool_slot_rejected endpoint={} transport_endpoint={}",
                self.endpoint,
                transport.endpoint()
            );
        }
        false
    }

    fn is_dead(&self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposing {
            return;
        }
        state.disposing = true;
        let drained: Vec<_> = state.available.drain(..).collect();
        drop(state);
        self.available_cond.notify_all();
        debug!("event=node_dispose endpoint={}", self.endpoint);
        for transport in drained {
            transport.shutdown();
        }
        for transport in self.roster.lock().drain(..) {
            transport.shutdown();
        }
    }
}

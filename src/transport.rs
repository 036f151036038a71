//! One socket connection to one node: blocking send path, dedicated receive
//! loop, FIFO request/response correlation and the authentication handshake.
//!
//! The receive loop owns the read half of the socket for the lifetime of the
//! connection. Because the protocol answers in send order on a single
//! connection and carries no correlation id in the header, the oldest
//! pending request is always the owner of the next inbound frame. That
//! strict ordering is an inherited protocol assumption: if responses could
//! ever reorder, this dequeue would misattribute them.
//!
//! A transport never restarts its own receive loop. Any I/O fault kills the
//! connection, fails whatever was pending, notifies the owning pool and, if
//! a reconnect delay is configured, hands recovery to a background thread
//! that re-runs the full connect-and-handshake sequence.

use crate::auth::{AuthStatus, Authenticator};
use crate::config::DisposeGuard;
use crate::error::TransportError;
use crate::headers::{ResponseHeader, Status, RESPONSE_HEADER_LEN};
use crate::request::CacheRequest;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Deferred setup hook: runs once, as soon as the transport is alive.
pub type SetupAction = Box<dyn FnOnce() + Send>;

/// One connection to one endpoint. The seam shared by the TCP
/// implementation and test doubles; the pool only ever talks through it.
pub trait Transport: Send + Sync {
    /// Attempts to put the request on the wire. `false` means the transport
    /// is dead or the write faulted: the request was not delivered here and
    /// the caller may retry elsewhere.
    fn try_send(&self, request: Arc<dyn CacheRequest>) -> bool;

    fn is_alive(&self) -> bool;

    /// Registers a one-shot action to run once the transport is alive. If it
    /// already is, the action runs immediately on the calling thread.
    fn register_setup(&self, action: SetupAction);

    /// Idempotent teardown: stops the receive loop, closes the socket and
    /// fails anything still pending. No dead notification, no reconnect.
    fn shutdown(&self);

    fn endpoint(&self) -> SocketAddr;

    /// Flags the transport as counted in its pool's working set. Returns
    /// true when this call did the registering.
    fn mark_registered(&self) -> bool;

    /// Clears the working-set flag. Returns true when it was set.
    fn clear_registered(&self) -> bool;
}

/// Observer wiring from a transport to its owning pool. All callbacks are
/// fire-and-forget and may be invoked concurrently from receive threads,
/// reconnect threads and sender threads.
#[derive(Clone)]
pub struct TransportCallbacks {
    pub on_transport_error: Arc<dyn Fn(&TransportError) + Send + Sync>,
    pub on_response: Arc<dyn Fn(&ResponseHeader) + Send + Sync>,
    pub on_protocol_error: Arc<dyn Fn(&ResponseHeader) + Send + Sync>,
    pub on_dead: Arc<dyn Fn(&Arc<dyn Transport>) + Send + Sync>,
    pub on_available: Arc<dyn Fn(&Arc<dyn Transport>) + Send + Sync>,
}

impl Default for TransportCallbacks {
    fn default() -> Self {
        Self {
            on_transport_error: Arc::new(|_| {}),
            on_response: Arc::new(|_| {}),
            on_protocol_error: Arc::new(|_| {}),
            on_dead: Arc::new(|_| {}),
            on_available: Arc::new(|_| {}),
        }
    }
}

/// Everything a transport needs at construction, assembled by the pool from
/// the client configuration.
pub struct TransportOptions {
    pub endpoint: SocketAddr,
    pub callbacks: TransportCallbacks,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub reconnect_delay: Option<Duration>,
    pub dispose_guard: DisposeGuard,
}

pub struct TcpTransport {
    endpoint: SocketAddr,
    callbacks: TransportCallbacks,
    authenticator: Option<Arc<dyn Authenticator>>,
    reconnect_delay: Option<Duration>,
    dispose_guard: DisposeGuard,
    alive: AtomicBool,
    shutting_down: AtomicBool,
    registered: AtomicBool,
    /// Bumped on every (re)connect and on intentional teardown, so a stale
    /// receive loop cannot fault a connection it no longer belongs to.
    generation: AtomicU64,
    /// First fault on a given connection wins; the rest are echoes of the
    /// same socket dying.
    faulted: AtomicBool,
    /// At most one reconnect thread per transport. A handshake that dies on
    /// the wire produces two recovery triggers, one from the receive loop
    /// fault and one from the failed connect call; only the first may
    /// schedule.
    reconnecting: AtomicBool,
    writer: Mutex<Option<TcpStream>>,
    pending: Mutex<VecDeque<Arc<dyn CacheRequest>>>,
    setup: Mutex<Option<SetupAction>>,
    weak_self: Weak<TcpTransport>,
}

impl TcpTransport {
    /// Creates the transport and synchronously attempts the first
    /// connection. A refused connect does not fail construction: the
    /// transport starts dead and, when a reconnect delay is configured,
    /// keeps trying in the background until the endpoint answers.
    pub fn start(options: TransportOptions) -> Arc<Self> {
        let transport = Arc::new_cyclic(|weak| Self {
            endpoint: options.endpoint,
            callbacks: options.callbacks,
            authenticator: options.authenticator,
            reconnect_delay: options.reconnect_delay,
            dispose_guard: options.dispose_guard,
            alive: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            writer: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            setup: Mutex::new(None),
            weak_self: weak.clone(),
        });
        if let Err(err) = transport.connect_once() {
            warn!(
                "event=transport_connect_failed endpoint={} error={}",
                transport.endpoint, err
            );
            (transport.callbacks.on_transport_error)(&err);
            transport.schedule_reconnect();
        }
        transport
    }

    /// Opens the socket, launches the receive loop and drives the handshake.
    /// The handshake blocks this thread on responses delivered by the
    /// freshly launched loop, which is why it must never run on the receive
    /// thread itself.
    fn connect_once(self: &Arc<Self>) -> Result<(), TransportError> {
        debug!("event=transport_connect endpoint={}", self.endpoint);
        let stream = TcpStream::connect(self.endpoint)?;
        let _ = stream.set_nodelay(true);
        let reader = stream.try_clone()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.faulted.store(false, Ordering::SeqCst);
        // Sever the previous connection's socket, if any survived. Its
        // receive loop shares that socket through a clone, so this unblocks
        // the loop and the stale generation check retires it.
        if let Some(old) = self.writer.lock().replace(stream) {
            let _ = old.shutdown(Shutdown::Both);
        }

        let me = self.clone();
        thread::Builder::new()
            .name(format!("recv-{}", self.endpoint))
            .spawn(move || me.receive_loop(reader, generation))?;

        if let Err(err) = self.authenticate() {
            // Stale-out the receive loop before closing the socket so the
            // read error it is about to see is not reported as a new fault.
            self.generation.fetch_add(1, Ordering::SeqCst);
            if let Some(stream) = self.writer.lock().take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            let orphans: Vec<_> = self.pending.lock().drain(..).collect();
            for request in orphans {
                request.handle_failure();
            }
            return Err(err);
        }

        self.alive.store(true, Ordering::SeqCst);
        info!("event=transport_ready endpoint={}", self.endpoint);
        let action = self.setup.lock().take();
        if let Some(action) = action {
            action();
        }
        if let Some(me) = self.as_dyn() {
            (self.callbacks.on_available)(&me);
        }
        Ok(())
    }

    fn authenticate(&self) -> Result<(), TransportError> {
        let Some(authenticator) = self.authenticator.as_ref() else {
            return Ok(());
        };
        debug!("event=auth_start endpoint={}", self.endpoint);
        let mut token = authenticator.create_token();
        loop {
            match token.step_authenticate() {
                (AuthStatus::Ok, _) => {
                    debug!("event=auth_done endpoint={}", self.endpoint);
                    return Ok(());
                }
                (AuthStatus::StepRequired, Some(request)) => self.send_request(request)?,
                (AuthStatus::StepRequired, None) => {
                    return Err(TransportError::Authentication(
                        "step required but the token produced no request".into(),
                    ))
                }
                (AuthStatus::Failed(status), _) => {
                    return Err(TransportError::Authentication(format!(
                        "handshake rejected with status {status:?}"
                    )))
                }
            }
        }
    }

    /// Appends to the pending queue before any byte hits the wire, under the
    /// writer lock, so queue order always matches wire order and a response
    /// can never be read before its request is recorded.
    fn send_request(&self, request: Arc<dyn CacheRequest>) -> Result<(), TransportError> {
        let bytes = request.wire_bytes();
        let mut writer = self.writer.lock();
        let stream = writer
            .as_mut()
            .ok_or_else(|| TransportError::Io(std::io::Error::other("socket not connected")))?;
        self.pending.lock().push_back(request);
        if let Err(err) = stream.write_all(&bytes) {
            self.pending.lock().pop_back();
            return Err(err.into());
        }
        Ok(())
    }

    fn receive_loop(self: Arc<Self>, mut reader: TcpStream, generation: u64) {
        loop {
            if let Err(err) = self.read_frame(&mut reader) {
                if self.shutting_down.load(Ordering::SeqCst)
                    || self.generation.load(Ordering::SeqCst) != generation
                {
                    debug!("event=receive_loop_exit endpoint={}", self.endpoint);
                } else {
                    self.fault(generation, err);
                }
                return;
            }
        }
    }

    /// Reads one full response frame, draining the header, extra and message
    /// segments to their declared lengths, correlates it to the oldest
    /// pending request and fans out the observation callbacks.
    fn read_frame(&self, reader: &mut TcpStream) -> Result<(), TransportError> {
        let mut header_buf = [0u8; RESPONSE_HEADER_LEN];
        reader.read_exact(&mut header_buf)?;
        let header = ResponseHeader::parse(&header_buf)?;

        let mut extra = vec![0u8; header.extra_len as usize];
        reader.read_exact(&mut extra)?;
        let mut message = vec![0u8; header.message_len()];
        reader.read_exact(&mut message)?;

        let request = self.pending.lock().pop_front();
        (self.callbacks.on_response)(&header);
        if header.status != Status::NoError {
            (self.callbacks.on_protocol_error)(&header);
        }
        match request {
            Some(request) => request.handle_response(&header, &extra, &message),
            None => warn!(
                "event=orphan_response endpoint={} opcode={:#04x}",
                self.endpoint, header.opcode
            ),
        }

        // Self-return: the transport is only reusable once its in-flight
        // request has been answered. During the handshake it stays out of
        // circulation (not alive yet).
        if self.alive.load(Ordering::SeqCst) {
            if let Some(me) = self.as_dyn() {
                (self.callbacks.on_available)(&me);
            }
        }
        Ok(())
    }

    /// Connection-fatal fault path: exactly once per connection, and only
    /// for the connection generation that observed it.
    fn fault(&self, generation: u64, err: TransportError) {
        if self.shutting_down.load(Ordering::SeqCst) || self.dispose_guard.is_disposing() {
            return;
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if self.faulted.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            "event=transport_fault endpoint={} error={}",
            self.endpoint, err
        );
        (self.callbacks.on_transport_error)(&err);
        let was_alive = self.alive.swap(false, Ordering::SeqCst);
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let orphans: Vec<_> = self.pending.lock().drain(..).collect();
        for request in orphans {
            request.handle_failure();
        }
        if was_alive {
            if let Some(me) = self.as_dyn() {
                (self.callbacks.on_dead)(&me);
            }
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let Some(delay) = self.reconnect_delay else {
            return;
        };
        if self.shutting_down.load(Ordering::SeqCst) || self.dispose_guard.is_disposing() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.weak_self.clone();
        let endpoint = self.endpoint;
        let spawned = thread::Builder::new()
            .name(format!("reconnect-{endpoint}"))
            .spawn(move || loop {
                thread::sleep(delay);
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                if transport.shutting_down.load(Ordering::SeqCst)
                    || transport.dispose_guard.is_disposing()
                {
                    transport.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                match transport.connect_once() {
                    Ok(()) => {
                        transport.reconnecting.store(false, Ordering::SeqCst);
                        // A fault between the connect and the flag clearing
                        // above gets swallowed by the single-flight guard.
                        // Re-check liveness; if the fresh connection already
                        // died and nobody else scheduled, this thread stays
                        // responsible.
                        if transport.is_alive()
                            || transport.reconnecting.swap(true, Ordering::SeqCst)
                        {
                            info!("event=transport_reconnected endpoint={endpoint}");
                            return;
                        }
                    }
                    Err(err) => {
                        debug!("event=transport_reconnect_failed endpoint={endpoint} error={err}")
                    }
                }
            });
        if let Err(err) = spawned {
            self.reconnecting.store(false, Ordering::SeqCst);
            warn!("event=reconnect_spawn_failed endpoint={endpoint} error={err}");
        }
    }

    fn as_dyn(&self) -> Option<Arc<dyn Transport>> {
        self.weak_self
            .upgrade()
            .map(|me| me as Arc<dyn Transport>)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Transport for TcpTransport {
    fn try_send(&self, request: Arc<dyn CacheRequest>) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        match self.send_request(request) {
            Ok(()) => true,
            Err(err) => {
                self.fault(generation, err);
                false
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn register_setup(&self, action: SetupAction) {
        let mut setup = self.setup.lock();
        if self.alive.load(Ordering::SeqCst) {
            drop(setup);
            action();
        } else {
            *setup = Some(action);
        }
    }

    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("event=transport_shutdown endpoint={}", self.endpoint);
        self.alive.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let orphans: Vec<_> = self.pending.lock().drain(..).collect();
        for request in orphans {
            request.handle_failure();
        }
    }

    fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    fn mark_registered(&self) -> bool {
        !self.registered.swap(true, Ordering::SeqCst)
    }

    fn clear_registered(&self) -> bool {
        self.registered.swap(false, Ordering::SeqCst)
    }
}

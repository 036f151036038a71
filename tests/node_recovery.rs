//! Node liveness end to end: a node goes dead when its last connection
//! drops and resurrects on its own once the endpoint answers again.

mod support;

use cachepool::{
    CacheNode, ClientConfiguration, NodeCallbacks, NodeConnectionPool, Status,
};
use parking_lot::Mutex;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use support::{read_request, wait_until, Outcome, TestRequest};

const OP_NOOP: u8 = 0x0a;

/// Echo server whose open connections can be severed on demand.
struct KillableServer {
    addr: std::net::SocketAddr,
    conns: Arc<Mutex<Vec<TcpStream>>>,
}

impl KillableServer {
    fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conns: Arc<Mutex<Vec<TcpStream>>> = Arc::new(Mutex::new(Vec::new()));
        let tracked = conns.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                tracked.lock().push(stream.try_clone().unwrap());
                thread::spawn(move || {
                    while let Ok(frame) = read_request(&mut stream) {
                        if support::write_response(
                            &mut stream,
                            frame.opcode,
                            Status::NoError,
                            &[],
                            &[],
                        )
                        .is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });
        Self { addr, conns }
    }

    fn sever_all(&self) {
        for stream in self.conns.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[test]
fn node_dies_with_last_connection_and_recovers() {
    support::init_logging();
    let server = KillableServer::spawn();

    let alive_count = Arc::new(AtomicUsize::new(0));
    let dead_count = Arc::new(AtomicUsize::new(0));
    let a = alive_count.clone();
    let d = dead_count.clone();
    let events = NodeCallbacks {
        on_node_alive: Arc::new(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        }),
        on_node_dead: Arc::new(move |_| {
            d.fetch_add(1, Ordering::SeqCst);
        }),
        ..NodeCallbacks::default()
    };

    let config = ClientConfiguration::new()
        .with_endpoints(vec![server.addr])
        .with_pool_size(2)
        .with_reconnect_delay(Some(Duration::from_millis(100)));
    let node = NodeConnectionPool::new(server.addr, &config, events);

    assert!(wait_until(|| !node.is_dead(), Duration::from_secs(5)));
    assert_eq!(alive_count.load(Ordering::SeqCst), 1);

    let request = TestRequest::new(OP_NOOP);
    assert!(node.try_send(request.clone(), Duration::from_secs(1)));
    assert!(matches!(
        request.completion.wait_for(Duration::from_secs(2)),
        Some(Outcome::Response { .. })
    ));

    // Sever every connection: in-flight reads fault, the working count
    // drains to zero and the node reports dead exactly once.
    server.sever_all();
    assert!(wait_until(
        || dead_count.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));

    // The endpoint still answers, so background reconnection brings the
    // node back without any caller involvement.
    assert!(wait_until(
        || alive_count.load(Ordering::SeqCst) >= 2,
        Duration::from_secs(5)
    ));
    assert!(wait_until(|| !node.is_dead(), Duration::from_secs(5)));

    let request = TestRequest::new(OP_NOOP);
    assert!(wait_until(
        || node.try_send(request.clone(), Duration::from_millis(500)),
        Duration::from_secs(5)
    ));

    node.dispose();
}

#[test]
fn unreachable_endpoint_yields_a_dead_node_and_failing_sends() {
    support::init_logging();
    // Bind then drop, so the port is very likely unoccupied.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let config = ClientConfiguration::new()
        .with_endpoints(vec![addr])
        .with_pool_size(2)
        .with_reconnect_delay(None);
    let node = NodeConnectionPool::new(addr, &config, NodeCallbacks::default());

    assert!(node.is_dead());
    assert_eq!(node.working_transports(), 0);
    let request = TestRequest::new(OP_NOOP);
    assert!(!node.try_send(request.clone(), Duration::from_millis(100)));
    node.dispose();
}

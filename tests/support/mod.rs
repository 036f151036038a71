#![allow(dead_code)]

use cachepool::{
    CacheRequest, CompletionSlot, ResponseHeader, Status, REQUEST_MAGIC, RESPONSE_HEADER_LEN,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `pred` until it holds or the deadline passes.
pub fn wait_until(pred: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    pred()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Response {
        status: Status,
        extra: Vec<u8>,
        message: Vec<u8>,
    },
    Failed,
}

/// Minimal request implementation for driving the core: a bare header frame
/// plus a one-shot outcome slot.
pub struct TestRequest {
    opcode: u8,
    pub completion: CompletionSlot<Outcome>,
}

impl TestRequest {
    pub fn new(opcode: u8) -> Arc<Self> {
        Arc::new(Self {
            opcode,
            completion: CompletionSlot::new(),
        })
    }
}

impl CacheRequest for TestRequest {
    fn wire_bytes(&self) -> Vec<u8> {
        let mut frame = Vec::new();
        cachepool::write_request_header(&mut frame, self.opcode, 0, 0, 0, 0);
        frame
    }

    fn handle_response(&self, header: &ResponseHeader, extra: &[u8], message: &[u8]) {
        self.completion.set(Outcome::Response {
            status: header.status,
            extra: extra.to_vec(),
            message: message.to_vec(),
        });
    }

    fn handle_failure(&self) {
        self.completion.set(Outcome::Failed);
    }
}

/// One decoded request frame as a scripted server sees it.
pub struct RequestFrame {
    pub opcode: u8,
    pub key: Vec<u8>,
    pub extra: Vec<u8>,
    pub value: Vec<u8>,
}

pub fn read_request(stream: &mut TcpStream) -> std::io::Result<RequestFrame> {
    let mut header = [0u8; RESPONSE_HEADER_LEN];
    stream.read_exact(&mut header)?;
    assert_eq!(header[0], REQUEST_MAGIC, "client frames start with the request magic");
    let opcode = header[1];
    let key_len = u16::from_be_bytes(header[2..4].try_into().unwrap()) as usize;
    let extra_len = header[4] as usize;
    let total = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let mut body = vec![0u8; total];
    stream.read_exact(&mut body)?;
    Ok(RequestFrame {
        opcode,
        extra: body[..extra_len].to_vec(),
        key: body[extra_len..extra_len + key_len].to_vec(),
        value: body[extra_len + key_len..].to_vec(),
    })
}

pub fn write_response(
    stream: &mut TcpStream,
    opcode: u8,
    status: Status,
    extra: &[u8],
    message: &[u8],
) -> std::io::Result<()> {
    let header = ResponseHeader {
        opcode,
        key_len: 0,
        extra_len: extra.len() as u8,
        data_type: 0,
        status,
        total_body_len: (extra.len() + message.len()) as u32,
        opaque: 0,
        cas: 0,
    };
    stream.write_all(&header.encode())?;
    stream.write_all(extra)?;
    stream.write_all(message)?;
    Ok(())
}

/// Spawns a server that answers every request frame on every connection
/// through `handler`. Returning `None` drops the connection.
pub fn spawn_server<H>(handler: H) -> SocketAddr
where
    H: Fn(&RequestFrame) -> Option<(Status, Vec<u8>, Vec<u8>)> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            let handler = handler.clone();
            thread::spawn(move || {
                while let Ok(frame) = read_request(&mut stream) {
                    match handler(&frame) {
                        Some((status, extra, message)) => {
                            if write_response(&mut stream, frame.opcode, status, &extra, &message)
                                .is_err()
                            {
                                return;
                            }
                        }
                        None => return,
                    }
                }
            });
        }
    });
    addr
}

//! Minimal Modbus TCP server for the integration tests.
//!
//! Answers read holding (`0x03`) and read input (`0x04`) requests from an in-memory register
//! table; every register not set explicitly reads as `0`. Faults can be queued to make the
//! next request fail in a specific way.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How the next request should fail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    /// Drop the connection without answering.
    Reset,
    /// Answer with the given exception code.
    Exception(u8),
    /// Answer with a transaction id that does not match the request.
    WrongTransaction,
}

#[derive(Default)]
struct State {
    input: HashMap<u16, u16>,
    holding: HashMap<u16, u16>,
    faults: VecDeque<Fault>,
    delay: Duration,
    requests: Vec<(u8, u16, u16)>,
    connections: usize,
}

/// Handle to a running server. The server stops when the handle is dropped.
pub struct DummyServer {
    state: Arc<Mutex<State>>,
    listener: JoinHandle<()>,
}

impl DummyServer {
    pub fn set_input_register(&self, address: u16, value: u16) {
        self.state.lock().unwrap().input.insert(address, value);
    }

    pub fn set_holding_register(&self, address: u16, value: u16) {
        self.state.lock().unwrap().holding.insert(address, value);
    }

    /// Make the next request fail with `fault`. Faults are used in the order they were queued.
    pub fn fail_next(&self, fault: Fault) {
        self.state.lock().unwrap().faults.push_back(fault);
    }

    /// Wait this long before answering each request.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Every request received so far as `(function, address, quantity)`.
    pub fn requests(&self) -> Vec<(u8, u16, u16)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }
}

impl Drop for DummyServer {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Start a server on a free local port.
pub async fn start_dummy_server() -> (DummyServer, u16) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|e| panic!("failed to bind test server: {}", e));
    let port = listener
        .local_addr()
        .unwrap_or_else(|e| panic!("failed to get test server address: {}", e))
        .port();

    let state = Arc::new(Mutex::new(State::default()));
    let shared = state.clone();
    let handle = tokio::spawn(async move {
        let mut sessions = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            shared.lock().unwrap().connections += 1;
            sessions.push(AbortOnDrop(tokio::spawn(serve(stream, shared.clone()))));
        }
    });
    (DummyServer { state, listener: handle }, port)
}

// sessions die with the listener task
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    loop {
        let mut head = [0u8; 7];
        if stream.read_exact(&mut head).await.is_err() {
            return;
        }
        let (tid, len, uid) = decode_header(&head);
        if len < 2 {
            return;
        }
        let mut pdu = vec![0u8; len - 1];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }
        let (fun, addr, qty) = decode_request(&pdu);

        let (fault, delay, values) = {
            let mut state = state.lock().unwrap();
            state.requests.push((fun, addr, qty));
            let table = match fun {
                0x03 => Some(&state.holding),
                0x04 => Some(&state.input),
                _ => None,
            };
            let values: Option<Vec<u16>> = table.map(|t| {
                (0..qty).map(|i| *t.get(&addr.wrapping_add(i)).unwrap_or(&0)).collect()
            });
            (state.faults.pop_front(), state.delay, values)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut reply_tid = tid;
        let body = match (fault, values) {
            (Some(Fault::Reset), _) => return,
            (Some(Fault::Exception(code)), _) => vec![fun | 0x80, code],
            (_, None) => vec![fun | 0x80, 0x01],
            (fault, Some(values)) => {
                if fault == Some(Fault::WrongTransaction) {
                    reply_tid = tid.wrapping_add(100);
                }
                encode_registers(fun, &values)
            }
        };

        if stream.write_all(&encode_frame(reply_tid, uid, &body)).await.is_err() {
            return;
        }
    }
}

// (tid, length, unit id)
fn decode_header(head: &[u8]) -> (u16, usize, u8) {
    let mut rdr = Cursor::new(head);
    let tid = rdr.read_u16::<BigEndian>().unwrap_or(0);
    let _pid = rdr.read_u16::<BigEndian>().unwrap_or(0);
    let len = rdr.read_u16::<BigEndian>().unwrap_or(0) as usize;
    let uid = rdr.read_u8().unwrap_or(0);
    (tid, len, uid)
}

// (function, address, quantity)
fn decode_request(pdu: &[u8]) -> (u8, u16, u16) {
    let mut rdr = Cursor::new(pdu);
    let fun = rdr.read_u8().unwrap_or(0);
    let addr = rdr.read_u16::<BigEndian>().unwrap_or(0);
    let qty = rdr.read_u16::<BigEndian>().unwrap_or(0);
    (fun, addr, qty)
}

fn encode_registers(fun: u8, values: &[u16]) -> Vec<u8> {
    let mut body = vec![fun, (values.len() * 2) as u8];
    for v in values {
        let _ = body.write_u16::<BigEndian>(*v);
    }
    body
}

fn encode_frame(tid: u16, uid: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + body.len());
    let _ = frame.write_u16::<BigEndian>(tid);
    let _ = frame.write_u16::<BigEndian>(0);
    let _ = frame.write_u16::<BigEndian>(body.len() as u16 + 1);
    let _ = frame.write_u8(uid);
    frame.extend_from_slice(body);
    frame
}

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chorus_http2::{FinishedStatus, RequestSource, ResponseSink, SinkResult, SourceResult};

pub fn setup_tracing() {
    use tracing_subscriber::EnvFilter;
    _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Loopback HTTP/1.1 server running one handler thread per connection.
///
/// The engine's contract is version-agnostic, so plain HTTP/1.1 exercises
/// the full dispatch/backpressure/teardown machinery without TLS.
pub struct TestServer {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn spawn<F>(handler: F) -> Self
    where
        F: Fn(TcpStream) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
        let addr = listener.local_addr().expect("listener address");
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let handler = Arc::new(handler);
        let accept_thread = thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else { break };
                let handler = Arc::clone(&handler);
                thread::spawn(move || handler(stream));
            }
        });
        Self {
            addr,
            shutdown,
            accept_thread: Some(accept_thread),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // unblock the accept loop
        _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.accept_thread.take() {
            _ = handle.join();
        }
    }
}

/// Reads the request head, and a chunked body when one is announced.
/// Returns everything read.
pub fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    // head
    while !contains(&received, b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) => return received,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(_) => return received,
        }
    }
    let head_lower = received.to_ascii_lowercase();
    if contains(&head_lower, b"transfer-encoding: chunked") {
        while !contains(&received, b"0\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
    }
    received
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// Responds 200 with the given body and closes the connection.
pub fn respond_ok(stream: &mut TcpStream, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    _ = stream.write_all(head.as_bytes());
    _ = stream.write_all(body);
    _ = stream.flush();
}

/// Handler serving a fixed 200 response.
pub fn ok_handler(body: &'static [u8]) -> impl Fn(TcpStream) + Send + Sync + 'static {
    move |mut stream| {
        read_request(&mut stream);
        respond_ok(&mut stream, body);
    }
}

/// Handler that reads the request and then goes silent until the peer
/// hangs up.
pub fn stall_handler() -> impl Fn(TcpStream) + Send + Sync + 'static {
    |mut stream| {
        read_request(&mut stream);
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}

#[derive(Default)]
struct SinkData {
    codes: Vec<u32>,
    header_lines: usize,
    body: Vec<u8>,
    finished: Vec<FinishedStatus>,
    data_calls: usize,
    pauses_left: usize,
    code_seen_before_data: Option<bool>,
}

/// Shared view of everything a [`RecordingSink`] observed.
pub struct SinkRecord {
    data: Mutex<SinkData>,
    cond: Condvar,
}

impl SinkRecord {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(SinkData::default()),
            cond: Condvar::new(),
        })
    }

    /// Waits until a terminal status has been reported.
    pub fn wait_finished(&self, timeout: Duration) -> Option<FinishedStatus> {
        let data = self.data.lock().unwrap();
        let (data, _) = self
            .cond
            .wait_timeout_while(data, timeout, |data| data.finished.is_empty())
            .unwrap();
        data.finished.first().copied()
    }

    pub fn finished(&self) -> Vec<FinishedStatus> {
        self.data.lock().unwrap().finished.clone()
    }

    pub fn codes(&self) -> Vec<u32> {
        self.data.lock().unwrap().codes.clone()
    }

    pub fn body(&self) -> Vec<u8> {
        self.data.lock().unwrap().body.clone()
    }

    pub fn header_lines(&self) -> usize {
        self.data.lock().unwrap().header_lines
    }

    pub fn data_calls(&self) -> usize {
        self.data.lock().unwrap().data_calls
    }

    pub fn code_seen_before_data(&self) -> Option<bool> {
        self.data.lock().unwrap().code_seen_before_data
    }
}

/// Sink recording everything it receives; optionally answers the first few
/// body chunks with `Pause` to exercise backpressure.
pub struct RecordingSink {
    record: Arc<SinkRecord>,
}

impl RecordingSink {
    pub fn new(record: &Arc<SinkRecord>) -> Box<Self> {
        Box::new(Self {
            record: Arc::clone(record),
        })
    }

    pub fn with_pauses(record: &Arc<SinkRecord>, pauses: usize) -> Box<Self> {
        record.data.lock().unwrap().pauses_left = pauses;
        Box::new(Self {
            record: Arc::clone(record),
        })
    }
}

impl ResponseSink for RecordingSink {
    fn on_response_code(&mut self, code: u32) {
        self.record.data.lock().unwrap().codes.push(code);
        self.record.cond.notify_all();
    }

    fn on_header_line(&mut self, _line: &[u8]) {
        self.record.data.lock().unwrap().header_lines += 1;
    }

    fn on_data(&mut self, data: &[u8]) -> SinkResult {
        let mut record = self.record.data.lock().unwrap();
        record.data_calls += 1;
        if record.code_seen_before_data.is_none() {
            let code_seen = !record.codes.is_empty();
            record.code_seen_before_data = Some(code_seen);
        }
        if record.pauses_left > 0 {
            record.pauses_left -= 1;
            return SinkResult::Pause;
        }
        record.body.extend_from_slice(data);
        SinkResult::Success
    }

    fn on_finished(&mut self, status: FinishedStatus) {
        self.record.data.lock().unwrap().finished.push(status);
        self.record.cond.notify_all();
    }
}

/// Source feeding a fixed body, one buffer fill at a time.
pub struct VecSource {
    headers: Vec<String>,
    remaining: Vec<u8>,
}

impl VecSource {
    pub fn new(headers: Vec<String>, body: &[u8]) -> Box<Self> {
        Box::new(Self {
            headers,
            remaining: body.to_vec(),
        })
    }
}

impl RequestSource for VecSource {
    fn header_lines(&self) -> Vec<String> {
        self.headers.clone()
    }

    fn read_data(&mut self, buf: &mut [u8]) -> SourceResult {
        if self.remaining.is_empty() {
            return SourceResult::Complete;
        }
        let n = buf.len().min(self.remaining.len());
        buf[..n].copy_from_slice(&self.remaining[..n]);
        self.remaining.drain(..n);
        SourceResult::Continue(n)
    }
}

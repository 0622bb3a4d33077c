//! Multiplexed HTTP/2 client transport over libcurl's multi interface.
//!
//! One [`Http2Connection`] owns a dedicated background thread that drives
//! any number of concurrent, long-lived, bidirectional streams over a single
//! connection, including an always-open, mostly-idle downchannel. Producers
//! never block: [`Http2Connection::create_and_send_request`] enqueues a
//! stream and returns immediately; everything else (handshake, transfer,
//! timeouts, teardown) happens on the background thread and is reported
//! through the stream's [`ResponseSink`].
//!
//! Backpressure is cooperative: a sink may return [`SinkResult::Pause`] and
//! the engine parks the stream until the next service pass un-pauses it.
//! Cancellation is an atomic flag ([`Http2Request::cancel`]) observed by the
//! loop within one iteration.

mod config;
mod connection;
mod easy;
mod error;
mod multi;
mod request;

pub use config::{ConnectionConfig, RequestConfig, RequestKind};
pub use connection::Http2Connection;
pub use error::TransportError;
pub use request::Http2Request;

/// Terminal status of a stream. Exactly one is reported per stream, exactly
/// once, through [`ResponseSink::on_finished`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedStatus {
    /// The transfer ran to completion (including non-2xx HTTP statuses; the
    /// sink learns those from the response code).
    Complete,
    /// The transfer timed out, or made no progress within the stream's
    /// activity timeout.
    Timeout,
    /// The stream was cancelled, or torn down by connection shutdown.
    Cancelled,
    /// The stream never ran, or died with the connection.
    InternalError,
}

/// What a sink wants done after receiving a chunk of response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkResult {
    /// All bytes consumed.
    Success,
    /// Nothing consumed; pause the stream. The same bytes are redelivered
    /// after the engine un-pauses it on a later service pass.
    Pause,
    /// Abort the transfer; the stream fails.
    Abort,
}

/// What a source produced when asked for outbound body bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceResult {
    /// `n` bytes were written into the buffer.
    Continue(usize),
    /// Nothing right now; pause the stream.
    Pause,
    /// Natural end of the body.
    Complete,
    /// Abort the transfer.
    Abort,
}

/// Receives one stream's response. All callbacks are invoked on the
/// connection's background thread, never concurrently for the same stream.
pub trait ResponseSink: Send {
    /// The HTTP response code, reported once, before any body bytes.
    fn on_response_code(&mut self, code: u32);

    /// One raw header line as received (not NUL-terminated, includes the
    /// line terminator when the wire had one).
    fn on_header_line(&mut self, line: &[u8]);

    /// A chunk of response body.
    fn on_data(&mut self, data: &[u8]) -> SinkResult;

    /// The stream's terminal status. Reported exactly once.
    fn on_finished(&mut self, status: FinishedStatus);
}

/// Provides one stream's outbound headers and (for POST) body bytes,
/// possibly incrementally.
pub trait RequestSource: Send {
    /// Extra header lines, `"Name: value"` each.
    fn header_lines(&self) -> Vec<String>;

    /// Fill `buf` with outbound body bytes.
    fn read_data(&mut self, buf: &mut [u8]) -> SourceResult;
}

/// Notified of connection-scoped events: the peer signalling it is going
/// away. Registration is independent of any stream.
pub trait ConnectionObserver: Send + Sync {
    fn on_goaway_received(&self);
}

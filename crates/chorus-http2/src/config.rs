use std::time::Duration;

use crate::{RequestSource, ResponseSink};

/// HTTP method of a stream. The engine's surface is deliberately narrow:
/// events go up as POST, everything else is fetched with GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Get,
    Post,
}

/// Everything needed to build and dispatch one stream.
pub struct RequestConfig {
    pub kind: RequestKind,
    pub url: String,
    /// Identifies the stream in logs; generated if absent.
    pub id: Option<String>,
    /// Outbound headers and (for POST) body bytes.
    pub source: Option<Box<dyn RequestSource>>,
    /// Receives the response. A stream without a sink still runs; its
    /// response is discarded.
    pub sink: Option<Box<dyn ResponseSink>>,
    /// Time allowed for connection establishment.
    pub connect_timeout: Option<Duration>,
    /// Time allowed for the whole transfer. Long-lived streams leave this
    /// unset.
    pub transfer_timeout: Option<Duration>,
    /// Fail the stream when no bytes move for this long. `None` disables
    /// the check.
    pub activity_timeout: Option<Duration>,
    /// The stream is expected to go quiet for long stretches (a
    /// downchannel); it never counts toward the all-paused backpressure
    /// computation.
    pub intermittent_transfer_expected: bool,
    /// Enable TCP keep-alive probing on the underlying connection.
    pub tcp_keep_alive: bool,
}

impl RequestConfig {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(RequestKind::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(RequestKind::Post, url)
    }

    fn new(kind: RequestKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            id: None,
            source: None,
            sink: None,
            connect_timeout: None,
            transfer_timeout: None,
            activity_timeout: None,
            intermittent_transfer_expected: false,
            tcp_keep_alive: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_source(mut self, source: Box<dyn RequestSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn ResponseSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = Some(timeout);
        self
    }

    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = Some(timeout);
        self
    }

    pub fn intermittent_transfer_expected(mut self) -> Self {
        self.intermittent_transfer_expected = true;
        self
    }

    pub fn with_tcp_keep_alive(mut self) -> Self {
        self.tcp_keep_alive = true;
        self
    }
}

/// Tunables for the servicing loop's wait budgets.
///
/// The paused budget matters because the multiplex wait returns immediately
/// on HTTP/2 connections even when every stream is logically paused
/// (full-duplex framing may still be flowing), so backpressure needs a real,
/// bounded sleep. The specific values are tuning, not correctness.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Multiplex wait budget for a normal service pass.
    pub wait_timeout: Duration,
    /// Wait budget while every non-intermittent stream is paused.
    pub paused_wait_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(100),
            paused_wait_timeout: Duration::from_millis(10),
        }
    }
}

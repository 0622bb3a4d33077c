//! The per-transfer adapter: a curl [`Handler`] owning one stream's sink,
//! source, and shared state, plus transfer-handle construction.

use std::sync::Arc;
use std::time::Duration;

use curl::easy::{Easy2, Handler, HttpVersion, List, ReadError, WriteError};
use tracing::{debug, trace};

use crate::config::RequestKind;
use crate::request::StreamState;
use crate::{FinishedStatus, RequestSource, ResponseSink, SinkResult, SourceResult};

/// Callback half of one stream. All callbacks run on the network thread,
/// never concurrently for the same stream.
pub(crate) struct TransferHandler {
    state: Arc<StreamState>,
    sink: Option<Box<dyn ResponseSink>>,
    source: Option<Box<dyn RequestSource>>,
}

impl TransferHandler {
    pub(crate) fn new(
        state: Arc<StreamState>,
        sink: Option<Box<dyn ResponseSink>>,
        source: Option<Box<dyn RequestSource>>,
    ) -> Self {
        Self {
            state,
            sink,
            source,
        }
    }

    pub(crate) fn state(&self) -> &Arc<StreamState> {
        &self.state
    }

    /// Reports the response code to the sink, at most once, once one has
    /// been seen on the wire.
    pub(crate) fn report_response_code(&mut self) {
        if let Some(code) = self.state.take_response_code_to_report() {
            debug!(stream = %self.state.id(), code, "response code");
            if let Some(sink) = &mut self.sink {
                sink.on_response_code(code);
            }
        }
    }

    /// Reports the terminal status, at most once.
    pub(crate) fn report_completion(&mut self, status: FinishedStatus) {
        if !self.state.mark_finished() {
            return;
        }
        debug!(stream = %self.state.id(), ?status, "stream finished");
        if let Some(sink) = &mut self.sink {
            sink.on_finished(status);
        }
    }

    fn request_header_lines(&self) -> Vec<String> {
        self.source
            .as_ref()
            .map(|source| source.header_lines())
            .unwrap_or_default()
    }
}

impl Handler for TransferHandler {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.state.mark_transfer();
        self.report_response_code();
        let Some(sink) = &mut self.sink else {
            return Ok(data.len());
        };
        match sink.on_data(data) {
            SinkResult::Success => Ok(data.len()),
            SinkResult::Pause => {
                trace!(stream = %self.state.id(), "sink backpressure, pausing");
                self.state.set_paused();
                Err(WriteError::Pause)
            }
            // a short write makes libcurl fail the transfer
            SinkResult::Abort => Ok(0),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        self.state.mark_transfer();
        let Some(source) = &mut self.source else {
            return Ok(0);
        };
        match source.read_data(buf) {
            SourceResult::Continue(n) => Ok(n.min(buf.len())),
            SourceResult::Pause => {
                trace!(stream = %self.state.id(), "source dry, pausing");
                self.state.set_paused();
                Err(ReadError::Pause)
            }
            SourceResult::Complete => Ok(0),
            SourceResult::Abort => Err(ReadError::Abort),
        }
    }

    fn header(&mut self, line: &[u8]) -> bool {
        self.state.mark_transfer();
        if let Some(code) = parse_status_line(line) {
            self.state.set_response_code(code);
        }
        if let Some(sink) = &mut self.sink {
            sink.on_header_line(line);
        }
        true
    }
}

/// Extracts the status code from an `HTTP/<version> <code> ...` status
/// line. Redirects produce several; the latest wins.
fn parse_status_line(line: &[u8]) -> Option<u32> {
    let line = std::str::from_utf8(line).ok()?;
    let rest = line.strip_prefix("HTTP/")?;
    let mut parts = rest.split_whitespace();
    let _version = parts.next()?;
    parts.next()?.parse().ok()
}

/// Builds and configures the transfer handle for one stream. On failure the
/// handler's sink has already been told `InternalError`.
pub(crate) fn build_transfer(
    kind: RequestKind,
    url: &str,
    connect_timeout: Option<Duration>,
    transfer_timeout: Option<Duration>,
    tcp_keep_alive: bool,
    handler: TransferHandler,
) -> Result<Easy2<TransferHandler>, curl::Error> {
    let header_lines = handler.request_header_lines();
    let mut easy = Easy2::new(handler);
    if let Err(error) = configure(
        &mut easy,
        kind,
        url,
        header_lines,
        connect_timeout,
        transfer_timeout,
        tcp_keep_alive,
    ) {
        easy.get_mut().report_completion(FinishedStatus::InternalError);
        return Err(error);
    }
    Ok(easy)
}

fn configure(
    easy: &mut Easy2<TransferHandler>,
    kind: RequestKind,
    url: &str,
    header_lines: Vec<String>,
    connect_timeout: Option<Duration>,
    transfer_timeout: Option<Duration>,
    tcp_keep_alive: bool,
) -> Result<(), curl::Error> {
    easy.url(url)?;
    easy.http_version(HttpVersion::V2)?;
    // share the one connection instead of opening another
    easy.pipewait(true)?;
    let mut headers = List::new();
    for line in &header_lines {
        headers.append(line)?;
    }
    match kind {
        RequestKind::Get => easy.get(true)?,
        RequestKind::Post => {
            easy.post(true)?;
            // body length is unknown up front: libcurl streams it from the
            // read callback; suppress the 100-continue round trip
            headers.append("Expect:")?;
            headers.append("Transfer-Encoding: chunked")?;
        }
    }
    easy.http_headers(headers)?;
    if let Some(timeout) = connect_timeout {
        easy.connect_timeout(timeout)?;
    }
    if let Some(timeout) = transfer_timeout {
        easy.timeout(timeout)?;
    }
    if tcp_keep_alive {
        easy.tcp_keepalive(true)?;
    }
    Ok(())
}

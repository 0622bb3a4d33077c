//! The connection event loop: a dedicated network thread owns the
//! multiplexing engine and drives every stream from dispatch to its terminal
//! status.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use curl::easy::Easy2;
use curl::Version;
use tracing::{debug, error, info, trace, warn};

use crate::easy::{self, TransferHandler};
use crate::error::{LoopExit, TransportError};
use crate::multi::MultiWrapper;
use crate::request::{Http2Request, StreamState};
use crate::{ConnectionConfig, ConnectionObserver, FinishedStatus, RequestConfig};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(0);

struct Queue {
    stopping: bool,
    pending: VecDeque<Easy2<TransferHandler>>,
}

struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
    /// Guarded separately from the queue; the two critical sections are
    /// never nested.
    observers: Mutex<Vec<Arc<dyn ConnectionObserver>>>,
    config: ConnectionConfig,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopping(&self) -> bool {
        self.lock_queue().stopping
    }

    fn set_stopping(&self) {
        self.lock_queue().stopping = true;
        self.wake.notify_all();
    }
}

/// One logical HTTP/2 connection multiplexing many concurrent streams.
///
/// Producers only ever enqueue requests, flip a stream's cancel flag, or
/// register observers; all transfer work happens on the background thread.
/// [`Http2Connection::disconnect`] (also run by `Drop`) joins that thread.
pub struct Http2Connection {
    shared: Arc<Shared>,
    network_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Http2Connection {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_config(ConnectionConfig::default())
    }

    pub fn with_config(config: ConnectionConfig) -> Result<Self, TransportError> {
        if !Version::get().feature_http2() {
            error!("libcurl was built without HTTP/2 support");
            return Err(TransportError::Http2Unsupported);
        }
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                stopping: false,
                pending: VecDeque::new(),
            }),
            wake: Condvar::new(),
            observers: Mutex::new(Vec::new()),
            config,
        });
        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("chorus-http2-network".into())
            .spawn(move || network_loop(loop_shared))?;
        Ok(Self {
            shared,
            network_thread: Mutex::new(Some(handle)),
        })
    }

    /// Builds a stream from `config`, enqueues it for dispatch, and returns
    /// immediately; the transfer happens on the background thread.
    ///
    /// On failure the stream's sink has already received
    /// [`FinishedStatus::InternalError`].
    pub fn create_and_send_request(
        &self,
        config: RequestConfig,
    ) -> Result<Http2Request, TransportError> {
        let RequestConfig {
            kind,
            url,
            id,
            source,
            sink,
            connect_timeout,
            transfer_timeout,
            activity_timeout,
            intermittent_transfer_expected,
            tcp_keep_alive,
        } = config;
        let id = id.unwrap_or_else(|| {
            format!("stream-{}", NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
        });
        let state = Arc::new(StreamState::new(
            id,
            activity_timeout,
            intermittent_transfer_expected,
        ));
        let handler = TransferHandler::new(Arc::clone(&state), sink, source);
        let easy = easy::build_transfer(
            kind,
            &url,
            connect_timeout,
            transfer_timeout,
            tcp_keep_alive,
            handler,
        )?;

        let mut slot = Some(easy);
        {
            let mut queue = self.shared.lock_queue();
            if !queue.stopping {
                if let Some(easy) = slot.take() {
                    queue.pending.push_back(easy);
                }
            }
        }
        match slot {
            None => {
                self.shared.wake.notify_one();
                debug!(stream = %state.id(), url = %url, "request enqueued");
                Ok(Http2Request::new(state))
            }
            Some(mut easy) => {
                warn!(stream = %state.id(), "request submitted while stopping");
                easy.get_mut().report_completion(FinishedStatus::InternalError);
                Err(TransportError::Stopping)
            }
        }
    }

    /// Signals stop, wakes the loop, and joins the background thread. Safe
    /// to call repeatedly and from any thread.
    pub fn disconnect(&self) {
        debug!("disconnect requested");
        self.shared.set_stopping();
        let handle = self
            .network_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("network thread panicked");
            }
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn ConnectionObserver>) {
        self.shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| !Arc::ptr_eq(existing, observer));
    }
}

impl Drop for Http2Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn network_loop(shared: Arc<Shared>) {
    debug!("network loop starting");
    let mut next_token: usize = 0;

    while !shared.is_stopping() {
        // the engine is recreated per service cycle so a prior hard failure
        // can be recovered from without destroying the connection object
        let mut multi = match MultiWrapper::new() {
            Ok(multi) => multi,
            Err(error) => {
                error!(%error, "failed to create the multiplex engine");
                shared.set_stopping();
                break;
            }
        };

        {
            let mut queue = shared.lock_queue();
            while !queue.stopping && queue.pending.is_empty() {
                queue = shared
                    .wake
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if queue.stopping {
                break;
            }
        }

        process_next_request(&shared, &mut multi, &mut next_token);
        let exit = service(&shared, &mut multi, &mut next_token);
        let status = match exit {
            LoopExit::Drained => FinishedStatus::Cancelled,
            LoopExit::EngineFailure => FinishedStatus::InternalError,
        };
        drain_active(&mut multi, status);
        if exit == LoopExit::EngineFailure && !shared.is_stopping() {
            info!("multiplex engine failed; recreating and resuming service");
        }
    }

    drain_pending(&shared);
    debug!("network loop exiting");
}

/// The servicing loop: drives I/O until no transfers remain, stop is
/// requested, or the engine fails hard.
fn service(shared: &Arc<Shared>, multi: &mut MultiWrapper, next_token: &mut usize) -> LoopExit {
    while multi.len() > 0 && !shared.is_stopping() {
        match multi.perform() {
            Ok(running) => trace!(running, "performed multiplex step"),
            Err(error) => {
                error!(%error, "multiplex perform failed");
                return LoopExit::EngineFailure;
            }
        }

        harvest_finished(shared, multi);
        sweep_cancelled_and_stalled(multi);
        if shared.is_stopping() {
            break;
        }
        // one per pass, so a pending burst cannot starve I/O
        process_next_request(shared, multi, next_token);

        let paused = all_non_intermittent_paused(
            multi
                .iter()
                .map(|(_, handle)| {
                    let state = handle.get_ref().state();
                    (
                        state.is_paused(),
                        state.is_intermittent_transfer_expected(),
                    )
                }),
        );
        let timeout = if paused {
            shared.config.paused_wait_timeout
        } else {
            shared.config.wait_timeout
        };
        let before = Instant::now();
        if let Err(error) = multi.wait(timeout) {
            error!(%error, "multiplex wait failed");
            return LoopExit::EngineFailure;
        }
        // the multiplex wait returns immediately on HTTP/2 connections even
        // when every stream is logically paused (full-duplex framing may
        // still be flowing), so backpressure gets a real, bounded sleep
        if paused {
            if let Some(remaining) = timeout.checked_sub(before.elapsed()) {
                if !remaining.is_zero() {
                    thread::sleep(remaining);
                }
            }
        }
        unpause_active(multi);
    }
    LoopExit::Drained
}

/// Dequeues one pending request and registers it with the engine.
fn process_next_request(shared: &Arc<Shared>, multi: &mut MultiWrapper, next_token: &mut usize) {
    let easy = {
        let mut queue = shared.lock_queue();
        if queue.stopping {
            return;
        }
        queue.pending.pop_front()
    };
    let Some(easy) = easy else {
        return;
    };
    let state = Arc::clone(easy.get_ref().state());
    state.mark_transfer();
    let token = *next_token;
    *next_token += 1;
    debug!(stream = %state.id(), token, "registering stream");
    if let Err((error, recovered)) = multi.attach(token, easy) {
        error!(stream = %state.id(), %error, "failed to register stream");
        if let Some(mut easy) = recovered {
            easy.get_mut().report_completion(FinishedStatus::InternalError);
        }
    }
}

/// Reports and deregisters every transfer the engine finished: the response
/// code first (if not already reported), then `Timeout` for a transfer-level
/// timeout, `Complete` otherwise.
fn harvest_finished(shared: &Arc<Shared>, multi: &mut MultiWrapper) {
    for (token, transfer_error) in multi.completed() {
        let Some(mut easy) = multi.detach(token) else {
            warn!(token, "finished message for an unknown stream");
            continue;
        };
        let handler = easy.get_mut();
        handler.report_response_code();
        let status = match &transfer_error {
            Some(error) if error.is_operation_timedout() => FinishedStatus::Timeout,
            _ => FinishedStatus::Complete,
        };
        if let Some(error) = &transfer_error {
            debug!(
                stream = %handler.state().id(),
                %error,
                "stream finished with transfer error"
            );
            // a connection-level protocol failure is the closest signal we
            // get to the peer going away
            if error.is_http2_error() {
                notify_goaway_received(shared);
            }
        }
        handler.report_completion(status);
    }
}

/// Unwinds streams flagged cancelled, and streams whose activity timeout
/// elapsed with no byte movement.
fn sweep_cancelled_and_stalled(multi: &mut MultiWrapper) {
    let now = Instant::now();
    let mut unwind: Vec<(usize, FinishedStatus)> = Vec::new();
    for (&token, handle) in multi.iter() {
        let state = handle.get_ref().state();
        if state.is_cancelled() {
            info!(stream = %state.id(), "unwinding cancelled stream");
            unwind.push((token, FinishedStatus::Cancelled));
        } else if state.has_progress_timed_out(now) {
            warn!(stream = %state.id(), "stream progress timed out");
            unwind.push((token, FinishedStatus::Timeout));
        }
    }
    for (token, status) in unwind {
        if let Some(mut easy) = multi.detach(token) {
            easy.get_mut().report_completion(status);
        }
    }
}

/// All-paused computation for the wait budget: true when every
/// non-intermittent stream is paused (and there is at least one). A stream
/// expected to be intermittent never forces the backpressure wait path.
fn all_non_intermittent_paused(streams: impl Iterator<Item = (bool, bool)>) -> bool {
    let mut non_intermittent = 0usize;
    let mut paused = 0usize;
    for (is_paused, is_intermittent) in streams {
        if !is_intermittent {
            non_intermittent += 1;
            if is_paused {
                paused += 1;
            }
        }
    }
    paused > 0 && paused == non_intermittent
}

/// Gives every paused stream another chance to make progress on the next
/// pass.
fn unpause_active(multi: &mut MultiWrapper) {
    for (_, handle) in multi.iter_mut() {
        let state = Arc::clone(handle.get_ref().state());
        if state.clear_paused() {
            trace!(stream = %state.id(), "unpausing stream");
            if let Err(error) = handle.unpause_read() {
                warn!(stream = %state.id(), %error, "unpause read failed");
            }
            if let Err(error) = handle.unpause_write() {
                warn!(stream = %state.id(), %error, "unpause write failed");
            }
        }
    }
}

/// Forcibly unwinds every still-active stream on the way out of a service
/// cycle.
fn drain_active(multi: &mut MultiWrapper, status: FinishedStatus) {
    for mut easy in multi.detach_all() {
        let handler = easy.get_mut();
        info!(stream = %handler.state().id(), ?status, "draining active stream");
        handler.report_completion(status);
    }
}

/// Streams that were accepted but never dispatched still get exactly one
/// terminal callback.
fn drain_pending(shared: &Arc<Shared>) {
    let pending: Vec<Easy2<TransferHandler>> = {
        let mut queue = shared.lock_queue();
        queue.pending.drain(..).collect()
    };
    for mut easy in pending {
        let handler = easy.get_mut();
        info!(stream = %handler.state().id(), "draining undispatched stream");
        handler.report_completion(FinishedStatus::InternalError);
    }
}

fn notify_goaway_received(shared: &Arc<Shared>) {
    let observers: Vec<Arc<dyn ConnectionObserver>> = shared
        .observers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    info!("connection-level HTTP/2 failure; notifying observers of goaway");
    for observer in observers {
        observer.on_goaway_received();
    }
}

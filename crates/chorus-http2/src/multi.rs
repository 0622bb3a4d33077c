//! RAII wrapper around the multiplexing engine: owns the `Multi` handle and
//! the token-indexed set of attached transfers, and guarantees every handle
//! is detached before the engine is torn down.

use std::collections::HashMap;
use std::time::Duration;

use curl::easy::Easy2;
use curl::multi::{Easy2Handle, Multi};
use tracing::{error, warn};

use crate::easy::TransferHandler;
use crate::error::TransportError;

pub(crate) struct MultiWrapper {
    multi: Multi,
    handles: HashMap<usize, Easy2Handle<TransferHandler>>,
}

impl MultiWrapper {
    pub(crate) fn new() -> Result<Self, TransportError> {
        let mut multi = Multi::new();
        // HTTP/2 multiplexing on, HTTP/1.1 pipelining off
        multi.pipelining(false, true)?;
        Ok(Self {
            multi,
            handles: HashMap::new(),
        })
    }

    /// Registers a transfer under `token`. On failure the transfer is
    /// returned when it could be recovered, so the caller can still report
    /// a terminal status through its sink.
    pub(crate) fn attach(
        &mut self,
        token: usize,
        easy: Easy2<TransferHandler>,
    ) -> Result<(), (TransportError, Option<Easy2<TransferHandler>>)> {
        let mut handle = match self.multi.add2(easy) {
            Ok(handle) => handle,
            Err(error) => return Err((error.into(), None)),
        };
        if let Err(error) = handle.set_token(token) {
            let recovered = self.multi.remove2(handle).ok();
            return Err((TransportError::Setup(error), recovered));
        }
        self.handles.insert(token, handle);
        Ok(())
    }

    /// Deregisters and returns the transfer under `token`.
    pub(crate) fn detach(&mut self, token: usize) -> Option<Easy2<TransferHandler>> {
        let handle = self.handles.remove(&token)?;
        match self.multi.remove2(handle) {
            Ok(easy) => Some(easy),
            Err(error) => {
                error!(token, %error, "failed to deregister transfer");
                None
            }
        }
    }

    /// Deregisters every remaining transfer; the teardown path.
    pub(crate) fn detach_all(&mut self) -> Vec<Easy2<TransferHandler>> {
        let tokens: Vec<usize> = self.handles.keys().copied().collect();
        tokens
            .into_iter()
            .filter_map(|token| self.detach(token))
            .collect()
    }

    pub(crate) fn perform(&mut self) -> Result<u32, TransportError> {
        Ok(self.multi.perform()?)
    }

    pub(crate) fn wait(&mut self, timeout: Duration) -> Result<u32, TransportError> {
        Ok(self.multi.wait(&mut [], timeout)?)
    }

    /// Harvests the completed-transfer messages: `(token, transfer error)`
    /// pairs, `None` meaning clean completion.
    pub(crate) fn completed(&self) -> Vec<(usize, Option<curl::Error>)> {
        let mut done = Vec::new();
        self.multi.messages(|message| {
            match message.token() {
                Ok(token) => {
                    if let Some(result) = message.result() {
                        done.push((token, result.err()));
                    }
                }
                Err(error) => warn!(%error, "completed message without a token"),
            }
        });
        done
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&usize, &Easy2Handle<TransferHandler>)> {
        self.handles.iter()
    }

    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (&usize, &mut Easy2Handle<TransferHandler>)> {
        self.handles.iter_mut()
    }
}

impl Drop for MultiWrapper {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            warn!(
                remaining = self.handles.len(),
                "multi wrapper dropped with attached transfers"
            );
            let _ = self.detach_all();
        }
    }
}

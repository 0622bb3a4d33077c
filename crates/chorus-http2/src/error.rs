use std::fmt;

/// Why a request could not be submitted, or why the engine gave up.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// libcurl was built without HTTP/2 support.
    #[error("libcurl was built without HTTP/2 support")]
    Http2Unsupported,

    /// The connection is shutting down and accepts no new streams. The
    /// request's sink has already been told `InternalError`.
    #[error("connection is shutting down")]
    Stopping,

    /// Configuring the transfer handle failed.
    #[error("transfer setup failed: {0}")]
    Setup(#[from] curl::Error),

    /// Creating or driving the multiplexing engine failed.
    #[error("multiplex engine error: {0}")]
    Multi(#[from] curl::MultiError),

    /// The network thread could not be spawned.
    #[error("failed to spawn the network thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Why the servicing loop exited. Selects the terminal status reported to
/// the streams drained on the way out.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// No transfers remain, or stop was requested: drained streams are
    /// `Cancelled`.
    Drained,
    /// A hard perform/wait error: drained streams are `InternalError`, and
    /// the outer loop recreates the engine unless stop was requested.
    EngineFailure,
}

impl fmt::Debug for LoopExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopExit::Drained => f.write_str("Drained"),
            LoopExit::EngineFailure => f.write_str("EngineFailure"),
        }
    }
}

//! What happens when a call reveals a build-time misconfiguration.

use std::sync::Arc;

use parking_lot::Mutex;
use portico_core::ConfigError;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Exit status used by [`ExitProcess`] (`EX_SOFTWARE`).
pub const FATAL_EXIT_CODE: i32 = 70;

/// Receives configuration errors raised while handling calls.
///
/// Implementations must stop the process (or the server); the call that
/// raised the error gets no response.
pub trait FatalHandler: Send + Sync + 'static {
    fn fatal(&self, err: ConfigError);
}

/// Logs the error and exits immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitProcess;

impl FatalHandler for ExitProcess {
    fn fatal(&self, err: ConfigError) {
        error!(error = %err, "Fatal configuration error, exiting");
        std::process::exit(FATAL_EXIT_CODE);
    }
}

/// Records the first error and cancels the server's shared token, so
/// `Server::serve` shuts down and returns the error.
#[derive(Debug, Clone)]
pub struct ShutdownOnFatal {
    token: CancellationToken,
    cause: Arc<Mutex<Option<ConfigError>>>,
}

impl ShutdownOnFatal {
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            cause: Arc::new(Mutex::new(None)),
        }
    }

    /// Takes the recorded cause, if any.
    #[must_use]
    pub fn take(&self) -> Option<ConfigError> {
        self.cause.lock().take()
    }
}

impl FatalHandler for ShutdownOnFatal {
    fn fatal(&self, err: ConfigError) {
        error!(error = %err, "Fatal configuration error, shutting down");
        self.cause.lock().get_or_insert(err);
        self.token.cancel();
    }
}

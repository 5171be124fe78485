//! Interrupt handling.

use tokio_util::sync::CancellationToken;

use crate::tracing::prelude::*;

/// A token cancelled on the first Ctrl-C.
///
/// Must be called from within a tokio runtime. Every orchestrator command
/// takes a token, so callers that handle signals themselves can pass their
/// own instead.
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("Interrupted");
                    cancel.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for interrupts"),
            },
            _ = cancel.cancelled() => {}
        }
    });

    token
}

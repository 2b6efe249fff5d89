//! Error hook consulted on timeouts and fatal failures.

use std::time::Duration;

use crate::error::TransportError;

/// What a blocked session was trying to do when it ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Waiting for a queued packet to reach the wire.
    Send,
    /// Waiting for the next inbound packet.
    Receive,
    /// Waiting for the peer to open the send window.
    Window,
}

/// Details passed to [`ErrorHook::on_timeout()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutContext {
    /// Session that timed out.
    pub sid: u16,
    /// Operation in progress.
    pub operation: Operation,
    /// Time spent without progress.
    pub elapsed: Duration,
}

/// Decision returned by [`ErrorHook::on_timeout()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Keep waiting for another full timeout period.
    Continue,
    /// Give up: the connection is torn down and the caller sees
    /// [`TransportError::Timeout`].
    Abort,
}

/// Application callback for timeouts and fatal errors.
///
/// Hooks run on whichever thread hit the condition. `on_timeout` is called
/// without the connection lock held; `on_error` is called during teardown
/// with the lock held and must not call back into the connection.
pub trait ErrorHook: Send + Sync {
    /// Decide whether a timed-out operation keeps waiting.
    fn on_timeout(&self, ctx: &TimeoutContext) -> TimeoutAction;

    /// Observe the error that is about to close the connection.
    fn on_error(&self, _err: &TransportError) {}
}

/// Hook that aborts on the first timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHook;

impl ErrorHook for DefaultErrorHook {
    fn on_timeout(&self, ctx: &TimeoutContext) -> TimeoutAction {
        tracing::debug!(
            sid = ctx.sid,
            operation = ?ctx.operation,
            elapsed_ms = ctx.elapsed.as_millis() as u64,
            "aborting timed-out operation"
        );
        TimeoutAction::Abort
    }

    fn on_error(&self, err: &TransportError) {
        tracing::error!(error = %err, "TDS connection failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hook_aborts() {
        let ctx = TimeoutContext {
            sid: 0,
            operation: Operation::Receive,
            elapsed: Duration::from_secs(30),
        };
        assert_eq!(DefaultErrorHook.on_timeout(&ctx), TimeoutAction::Abort);
    }
}

//! Signal flags for the daemon: SIGHUP requests a rule reload, SIGINT and
//! SIGTERM request a drain-and-exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

use crate::core::errors::{CfnError, Result};

/// Flags the signal handlers set and the main loop polls.
#[derive(Debug, Clone, Default)]
pub struct SignalFlags {
    reload: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Flags with no handlers attached (tests, embedding hosts).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register process signal handlers that set these flags.
    pub fn install() -> Result<Self> {
        let flags = Self::new();
        let register = |signal, flag: &Arc<AtomicBool>| {
            signal_hook::flag::register(signal, Arc::clone(flag)).map_err(|e| {
                CfnError::Runtime {
                    details: format!("failed to register handler for signal {signal}: {e}"),
                }
            })
        };
        register(SIGHUP, &flags.reload)?;
        register(SIGINT, &flags.shutdown)?;
        register(SIGTERM, &flags.shutdown)?;
        Ok(flags)
    }

    /// Consume a pending reload request.
    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_request_is_consumed_once() {
        let flags = SignalFlags::new();
        assert!(!flags.take_reload());
        flags.request_reload();
        assert!(flags.take_reload());
        assert!(!flags.take_reload());
    }

    #[test]
    fn clones_share_state() {
        let flags = SignalFlags::new();
        let handler_side = flags.clone();
        handler_side.request_shutdown();
        assert!(flags.shutdown_requested());
    }
}

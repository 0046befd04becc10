// Beacon Relay - Gateway work-dispatch core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Cooperative shutdown flag

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide keep-running flag polled at every loop head
///
/// Clones share the same flag. It starts out running; [`ShutdownFlag::request`]
/// flips it once and for all.
#[derive(Debug, Clone)]
pub struct ShutdownFlag {
    running: Arc<AtomicBool>,
}

impl ShutdownFlag {
    /// Create a flag in the running state
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Ask every loop sharing this flag to stop
    pub fn request(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// True until shutdown has been requested
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once shutdown has been requested
    pub fn is_requested(&self) -> bool {
        !self.is_running()
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag_shared() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        assert!(clone.is_running());

        flag.request();
        assert!(clone.is_requested());
        assert!(!flag.is_running());
    }
}

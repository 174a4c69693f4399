//! Shared connection, DNS and TLS session caches across requests.

use std::sync::{Arc, Mutex};

use curl::easy::Easy2;

use crate::handler::Collector;

/// An opaque handle to a shared cache compartment.
///
/// Requests performed through the same share reuse the transport caches
/// built on its behalf: live connections, DNS entries and TLS session data
/// carry over to subsequent transactions. Clones refer to the same
/// compartment. Safe for concurrent use from multiple threads; the caller
/// keeps the share alive for as long as any request references it.
#[derive(Clone, Default)]
pub struct Share {
    pool: Arc<Mutex<Vec<Easy2<Collector>>>>,
}

impl Share {
    pub fn new() -> Share {
        Share::default()
    }

    /// Lease a cached transport handle, if one is idle.
    pub(crate) fn lease(&self) -> Option<Easy2<Collector>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    /// Return a handle to the compartment once its transfer is finished.
    pub(crate) fn restore(&self, easy: Easy2<Collector>) {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).push(easy);
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let idle = self.pool.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("Share").field("idle_handles", &idle).finish()
    }
}

//! Cooperative cancellation
//!
//! A single root token is cloned into every pass. Tasks check it at their
//! suspension points (per repo, per tag, per file); subprocess wrappers
//! poll it and kill the child when it trips.

use crate::{SporaError, SporaResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. Idempotent; observed by all clones.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Error-returning form for use at task boundaries.
    pub fn check(&self) -> SporaResult<()> {
        if self.is_cancelled() {
            Err(SporaError::Cancelled)
        } else {
            Ok(())
        }
    }
}

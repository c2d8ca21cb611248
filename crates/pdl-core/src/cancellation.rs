//! Cooperative cancellation for the block evaluator.
//!
//! # State Machine
//!
//! ```text
//! None ──→ Graceful ──→ Immediate
//! ```
//!
//! - `None` — running normally.
//! - `Graceful` — finish the current block, then stop at the next boundary.
//! - `Immediate` — stop now; the current trace is finalized with
//!   `has_error = true` and returned.
//!
//! The evaluator checks the token at every block boundary and between
//! iterations of `repeat`/`repeatUntil`/`for` (§5). There is no concept of
//! a "running tool" or child session here — PDL evaluation is a single
//! recursive descent, not a fleet of concurrently running operations — so
//! this is a pared-down version of the same token shape.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationState {
    #[default]
    None,
    Graceful,
    Immediate,
}

struct Inner {
    state: CancellationState,
}

/// Cooperative cancellation token. `Clone` is cheap (an `Arc` bump); every
/// clone observes the same underlying state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Mutex<Inner>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: CancellationState::None,
            })),
        }
    }

    pub fn state(&self) -> CancellationState {
        self.inner.lock().unwrap().state
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() != CancellationState::None
    }

    pub fn is_graceful(&self) -> bool {
        self.state() == CancellationState::Graceful
    }

    pub fn is_immediate(&self) -> bool {
        self.state() == CancellationState::Immediate
    }

    /// Returns `true` if this call changed the state.
    pub fn request_graceful(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CancellationState::None {
            inner.state = CancellationState::Graceful;
            true
        } else {
            false
        }
    }

    /// Returns `true` if this call changed the state.
    pub fn request_immediate(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CancellationState::Immediate {
            inner.state = CancellationState::Immediate;
            true
        } else {
            false
        }
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap().state = CancellationState::None;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

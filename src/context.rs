//! Per-connection mutable bag exposed to middleware.

use std::sync::{Arc, Mutex};

/// Mutable state middleware can read and rewrite mid-dispatch.
///
/// `remote_addr` is the only field the core reads back (to decide whether to
/// `switch_origin`), but middleware authors may stash whatever else they need
/// here in a future revision — the bag is deliberately small today.
#[derive(Debug, Clone)]
pub struct Context {
    pub remote_addr: String,
}

impl Context {
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Context {
            remote_addr: remote_addr.into(),
        }
    }
}

/// Shared handle middleware hooks receive; cheap to clone, short critical
/// sections only (no `.await` is ever held across the lock).
pub type ContextHandle = Arc<Mutex<Context>>;

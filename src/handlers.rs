//! Static table of intercepted verbs.
//!
//! Built once via [`OnceLock`] and never mutated again, matching the
//! reference implementation's process-wide `handlers` map. Verb handler
//! bodies live as [`crate::client_handler::ClientSession`] methods and are
//! dispatched here via a `match` on [`HandlerKind`] rather than a table of
//! function pointers, since an async method borrowing `&mut self` across an
//! `.await` doesn't fit into a plain fn-pointer table.

use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Proxy,
    User,
    Auth,
    Pbsz,
    Prot,
    Transfer,
}

#[derive(Debug, Clone, Copy)]
pub struct HandlerSpec {
    pub kind: HandlerKind,
    /// Suspend the origin-response pump while this handler runs.
    pub suspend: bool,
}

static TABLE: OnceLock<HashMap<&'static str, HandlerSpec>> = OnceLock::new();

fn build_table() -> HashMap<&'static str, HandlerSpec> {
    use HandlerKind::*;
    HashMap::from([
        ("PROXY", HandlerSpec { kind: Proxy, suspend: false }),
        ("USER", HandlerSpec { kind: User, suspend: true }),
        ("AUTH", HandlerSpec { kind: Auth, suspend: true }),
        ("PBSZ", HandlerSpec { kind: Pbsz, suspend: true }),
        ("PROT", HandlerSpec { kind: Prot, suspend: true }),
        ("RETR", HandlerSpec { kind: Transfer, suspend: false }),
        ("STOR", HandlerSpec { kind: Transfer, suspend: false }),
    ])
}

/// Look up the intercepted-verb spec for `verb` (already uppercased).
pub fn lookup(verb: &str) -> Option<HandlerSpec> {
    TABLE.get_or_init(build_table).get(verb).copied()
}

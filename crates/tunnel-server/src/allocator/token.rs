//! Single-use admission token bookkeeping.
//!
//! A token is inserted into the authorized set when a gateway is created
//! and removed exactly once, atomically with acceptance, at the first
//! successful socket handshake that presents it. Backed by a plain
//! `std::sync::Mutex` (not `tokio::sync::Mutex`): the WebSocket upgrade
//! callback that performs the check-and-consume is itself synchronous, so
//! this has to be lock-and-go without an `.await` point — the critical
//! section is a single `HashSet` operation, consistent with advice against
//! holding an async lock across a blocking callback boundary.

use std::collections::HashSet;
use std::sync::Mutex;
use tunnel_core::generate_token;

#[derive(Debug, Default)]
pub struct TokenAllocator {
    authorized: Mutex<HashSet<String>>,
}

impl TokenAllocator {
    pub fn new() -> Self {
        Self {
            authorized: Mutex::new(HashSet::new()),
        }
    }

    /// Mint a fresh token and record it as authorized.
    pub fn issue(&self) -> String {
        let token = generate_token();
        self.authorized.lock().unwrap().insert(token.clone());
        token
    }

    /// Attempt to consume `token`. Returns `true` exactly once per issued
    /// token — the second and subsequent calls with the same value return
    /// `false`. Linearizable: insertion and removal both go through the
    /// same mutex, so no caller can observe a token as both present and
    /// absent at once.
    pub fn consume(&self, token: &str) -> bool {
        self.authorized.lock().unwrap().remove(token)
    }

    /// Revoke a token without consuming it (used when a gateway is closed
    /// before any client ever redeems its token).
    pub fn revoke(&self, token: &str) {
        self.authorized.lock().unwrap().remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_consumption() {
        let allocator = TokenAllocator::new();
        let token = allocator.issue();
        assert!(allocator.consume(&token));
        assert!(!allocator.consume(&token));
    }

    #[test]
    fn unknown_token_is_rejected() {
        let allocator = TokenAllocator::new();
        assert!(!allocator.consume("not-a-real-token"));
    }

    #[test]
    fn revoke_prevents_future_consumption() {
        let allocator = TokenAllocator::new();
        let token = allocator.issue();
        allocator.revoke(&token);
        assert!(!allocator.consume(&token));
    }
}

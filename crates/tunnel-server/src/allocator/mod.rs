//! Server-exclusive shared state: the authorized token set and the leased
//! port set. Per the concurrency model, these are mutated only by
//! server-level operations (create, handshake, cleanup) — no other
//! component reads or writes them directly.

mod port;
mod token;

pub use port::PortAllocator;
pub use token::TokenAllocator;

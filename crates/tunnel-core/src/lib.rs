//! tunnel-core: shared protocol library for the NAT-traversal tunnel
//! subsystem.
//!
//! Provides the frame codec (muxer/demuxer), single-use admission token and
//! `quid` generation, the pinned control close codes, and the crate's error
//! type. Consumed by both `tunnel-server` and `tunnel-client` so that the
//! wire format stays byte-identical on both ends.

pub mod close_codes;
pub mod error;
pub mod frame;
pub mod token;

pub use error::{TunnelError, TunnelResult};
pub use frame::{parse_terminal_payload, terminal_payload, Demuxer, Frame, Muxer};
pub use token::{generate_quid, generate_token};

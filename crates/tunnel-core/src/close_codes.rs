//! Numeric close codes for the tunnel's control close frame.
//!
//! These values are an interface contract: client and server must agree on
//! them. `4000`+ is the private-use range for WebSocket close codes
//! (RFC 6455 §7.4.2), so the application-specific codes below stay clear of
//! the standard 1000–1015 range.

/// Graceful, expected closure.
pub const NORMAL: u16 = 1000;
/// The gateway referenced by the upgrade token no longer exists.
pub const GATEWAY_CLOSED: u16 = 4000;
/// The demuxer produced a well-formed frame with an unknown type tag.
pub const INVALID_FRAME_TYPE: u16 = 4001;
/// Any other internal error; the close reason carries human-readable detail.
pub const UNEXPECTED: u16 = 4002;
/// The tunnel's `quid` budget for this session was exceeded.
pub const RESOURCE_EXHAUSTED: u16 = 4003;

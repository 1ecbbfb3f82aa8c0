//! Self-delimiting frame codec for the tunnel's multiplexed wire.
//!
//! Wire format (pinned, identical on both ends of the tunnel):
//!
//! ```text
//! byte 0:              type tag      0x01 = Rpc, 0x02 = DataChannel
//! byte 1:              flags         bit0 = binary (DataChannel only)
//! bytes 2..4:          quid_len: u16 BE   (0 for Rpc)
//! bytes 4..4+quid_len: quid UTF-8         (absent for Rpc)
//! next 4 bytes:        payload_len: u32 BE
//! next payload_len:    payload
//! ```
//!
//! No version negotiation is performed; this layout is an interface
//! contract between client and server.

use crate::error::{TunnelError, TunnelResult};

const TAG_RPC: u8 = 0x01;
const TAG_DATACHANNEL: u8 = 0x02;
const FLAG_BINARY: u8 = 0b0000_0001;

/// One logical message on the multiplexed tunnel wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An opaque RPC envelope, round-tripped as raw bytes. Deserializing the
    /// envelope itself is the RPC schema's concern, not the codec's.
    Rpc { payload: Vec<u8> },
    /// A data-channel payload tagged with the caller-chosen `quid` that
    /// identifies one data-channel session end-to-end.
    DataChannel {
        quid: String,
        binary: bool,
        payload: Vec<u8>,
    },
}

impl Frame {
    fn type_tag(&self) -> u8 {
        match self {
            Frame::Rpc { .. } => TAG_RPC,
            Frame::DataChannel { .. } => TAG_DATACHANNEL,
        }
    }
}

/// Encode frame objects into the wire format, one contiguous buffer per
/// frame. Stateless: it never blocks and holds no buffering of its own.
pub struct Muxer;

impl Muxer {
    /// Encode a single [`Frame`] into its wire representation.
    ///
    /// Fails with [`TunnelError::InvalidFrame`] if a `DataChannel` frame
    /// carries an empty `quid` — every data-channel frame must be
    /// attributable to a session.
    pub fn encode(frame: &Frame) -> TunnelResult<Vec<u8>> {
        match frame {
            Frame::Rpc { payload } => {
                let mut buf = Vec::with_capacity(2 + 4 + 4 + payload.len());
                buf.push(TAG_RPC);
                buf.push(0);
                buf.extend_from_slice(&0u16.to_be_bytes());
                buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                buf.extend_from_slice(payload);
                Ok(buf)
            }
            Frame::DataChannel {
                quid,
                binary,
                payload,
            } => {
                if quid.is_empty() {
                    return Err(TunnelError::InvalidFrame(
                        "datachannel frame missing quid".into(),
                    ));
                }
                let quid_bytes = quid.as_bytes();
                let mut buf =
                    Vec::with_capacity(2 + 4 + quid_bytes.len() + 4 + payload.len());
                buf.push(frame.type_tag());
                buf.push(if *binary { FLAG_BINARY } else { 0 });
                buf.extend_from_slice(&(quid_bytes.len() as u16).to_be_bytes());
                buf.extend_from_slice(quid_bytes);
                buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                buf.extend_from_slice(payload);
                Ok(buf)
            }
        }
    }
}

/// Incremental frame parser. Accumulates bytes across arbitrary chunk
/// boundaries and yields whole [`Frame`]s as soon as they are complete.
#[derive(Debug, Default)]
pub struct Demuxer {
    buffer: Vec<u8>,
}

impl Demuxer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed a chunk of transport bytes and return every frame that became
    /// complete as a result. Partial trailing bytes remain buffered for the
    /// next call.
    ///
    /// Fails with [`TunnelError::MalformedFrame`] on any byte sequence that
    /// cannot be parsed under the pinned wire format; the owning session
    /// must be torn down by the caller when this happens.
    pub fn feed(&mut self, data: &[u8]) -> TunnelResult<Vec<Frame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            match Self::try_parse_one(&self.buffer)? {
                Some((frame, consumed)) => {
                    frames.push(frame);
                    self.buffer.drain(..consumed);
                }
                None => break,
            }
        }

        Ok(frames)
    }

    /// Attempt to parse exactly one frame from the front of `buf`. Returns
    /// `Ok(None)` if `buf` does not yet hold a complete frame.
    fn try_parse_one(buf: &[u8]) -> TunnelResult<Option<(Frame, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let tag = buf[0];
        let flags = buf[1];

        if tag != TAG_RPC && tag != TAG_DATACHANNEL {
            return Err(TunnelError::MalformedFrame(format!(
                "unknown type tag 0x{tag:02x}"
            )));
        }

        if buf.len() < 4 {
            return Ok(None);
        }
        let quid_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;

        let quid_start = 4;
        let quid_end = quid_start + quid_len;
        if buf.len() < quid_end + 4 {
            return Ok(None);
        }

        let payload_len_start = quid_end;
        let payload_len = u32::from_be_bytes([
            buf[payload_len_start],
            buf[payload_len_start + 1],
            buf[payload_len_start + 2],
            buf[payload_len_start + 3],
        ]) as usize;

        let payload_start = payload_len_start + 4;
        let payload_end = payload_start + payload_len;
        if buf.len() < payload_end {
            return Ok(None);
        }

        let payload = buf[payload_start..payload_end].to_vec();

        let frame = match tag {
            TAG_RPC => {
                if quid_len != 0 {
                    return Err(TunnelError::MalformedFrame(
                        "rpc frame carries a non-empty quid".into(),
                    ));
                }
                Frame::Rpc { payload }
            }
            TAG_DATACHANNEL => {
                let quid = String::from_utf8(buf[quid_start..quid_end].to_vec())
                    .map_err(|e| TunnelError::MalformedFrame(format!("invalid quid utf-8: {e}")))?;
                if quid.is_empty() {
                    return Err(TunnelError::MalformedFrame(
                        "datachannel frame missing quid".into(),
                    ));
                }
                Frame::DataChannel {
                    quid,
                    binary: flags & FLAG_BINARY != 0,
                    payload,
                }
            }
            _ => unreachable!(),
        };

        Ok(Some((frame, payload_end)))
    }

    /// Number of bytes currently buffered but not yet forming a complete
    /// frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Discard all buffered bytes. Used when tearing a session down.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Build the JSON payload carried by a terminal `DataChannel` frame emitted
/// when a loopback (or gateway peer) socket closes.
pub fn terminal_payload(code: u16, message: &str) -> Vec<u8> {
    serde_json::json!({ "code": code, "message": message })
        .to_string()
        .into_bytes()
}

/// Parse a terminal frame's JSON payload back into `(code, message)`.
pub fn parse_terminal_payload(payload: &[u8]) -> TunnelResult<(u16, String)> {
    let value: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| TunnelError::InvalidFrame(format!("invalid terminal payload: {e}")))?;
    let code = value
        .get("code")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| TunnelError::InvalidFrame("terminal payload missing code".into()))?
        as u16;
    let message = value
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Ok((code, message))
}

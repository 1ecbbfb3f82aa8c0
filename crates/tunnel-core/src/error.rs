use thiserror::Error;

/// Errors produced by the tunnel protocol layer.
///
/// Variant set mirrors the error kinds named by the tunnel subsystem's
/// design: codec/transport failures terminate the owning session and are
/// reported via an `error` event rather than crashing the process.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("admission denied: {0}")]
    AdmissionDenied(String),

    #[error("tunnels exhausted: {0} of {1} gateways in use")]
    TunnelsExhausted(usize, usize),

    #[error("no free port in range {0}-{1}")]
    NoFreePort(u16, u16),

    #[error("gateway bind failed: {0}")]
    BindFailed(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream rpc failure: {0}")]
    UpstreamRpcFailure(String),

    #[error("loopback failure: {0}")]
    LoopbackFailure(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;

use synthvid_protocol::{DecodeError, EncodeError, MessageType};
use thiserror::Error;

use crate::channel::TransportError;
use crate::device::DeviceState;

pub type Result<T> = std::result::Result<T, GfxError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GfxError {
    /// The host or the request asks for something this device does not offer.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("not enough video memory: need {required} bytes, have {available}")]
    NoMemory { required: u64, available: u64 },

    #[error("no resources: {0}")]
    NoResources(&'static str),

    /// Guest and host disagree about the protocol (echoed token mismatch, undecodable response).
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for {0:?}")]
    Timeout(MessageType),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("device is not ready (state: {0:?})")]
    NotReady(DeviceState),

    #[error("synthvid worker has stopped")]
    WorkerGone,
}

impl From<DecodeError> for GfxError {
    fn from(err: DecodeError) -> Self {
        GfxError::Protocol(err.to_string())
    }
}

impl From<EncodeError> for GfxError {
    fn from(err: EncodeError) -> Self {
        GfxError::BadArgument(err.to_string())
    }
}

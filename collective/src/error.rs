use crate::{ipc::PeerError, transport::TransportError};
use digit_layout::DigitLayout;
use std::fmt;
use thiserror::Error;

/// Failure kinds of a collective call.
///
/// Nothing here is retried inside the core: a collective only makes sense
/// when every rank agrees on the retry, so the decision belongs to the caller.
#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("data type {0:?} has no collective mapping")]
    UnsupportedType(DigitLayout),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("peer memory exchange failed: {0}")]
    PeerExchange(#[from] PeerError),

    #[error("collective transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("communicator initialization failed: {0}")]
    Initialization(String),

    #[error("invalid kernel configuration: {0}")]
    InvalidConfig(String),
}

impl CollectiveError {
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedType(_) => "UnsupportedTypeError",
            Self::ShapeMismatch(_) => "ShapeMismatchError",
            Self::PeerExchange(_) => "PeerExchangeError",
            Self::Transport(_) => "CollectiveTransportError",
            Self::Initialization(_) => "InitializationError",
            Self::InvalidConfig(_) => "InvalidConfigError",
        }
    }
}

pub(crate) fn shape_mismatch(msg: impl fmt::Display) -> CollectiveError {
    CollectiveError::ShapeMismatch(msg.to_string())
}

/// Operation names reported in diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OpKind {
    AllReduce,
    AllGather,
    AllToAll,
}

impl OpKind {
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::AllReduce => "AllReduce",
            Self::AllGather => "AllGather",
            Self::AllToAll => "AllToAll",
        }
    }
}

impl fmt::Display for OpKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed kernel call, tagged with the rank and operation it happened on.
#[derive(Debug, Error)]
#[error("rank {rank}: {op} failed with {}: {source}", .source.kind())]
pub struct KernelError {
    pub rank: usize,
    pub op: OpKind,
    #[source]
    pub source: CollectiveError,
}

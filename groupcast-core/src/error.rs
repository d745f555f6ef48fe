//! Error types and structured `error_stack` context types.

use std::fmt;

use crate::synode::{NodeNo, Synode};

/// Transport-facing result carrying a full `error_stack` report.
pub type WireResult<T> = error_stack::Result<T, WireError>;

/// Transport-level error.
#[derive(Debug)]
pub enum WireError {
    Connect(String),
    Codec(String),
    Io(std::io::Error),
    Handshake(String),
    /// The peer's protocol range does not overlap ours.
    Version(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Connect(e) => write!(f, "connection failed: {e}"),
            WireError::Codec(e) => write!(f, "codec error: {e}"),
            WireError::Io(e) => write!(f, "IO error: {e}"),
            WireError::Handshake(e) => write!(f, "handshake failed: {e}"),
            WireError::Version(e) => write!(f, "protocol mismatch: {e}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e)
    }
}

impl From<WireError> for std::io::Error {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io_err) => io_err,
            other => std::io::Error::other(other),
        }
    }
}

/// Fatal engine condition. The engine signals the embedder and unwinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// Cache could not be shrunk below its limit.
    OutOfCache,
    /// Allocation for a proposal failed.
    OutOfMemory,
    /// A peer told us we are too far behind to catch up from the log.
    TooFarBehind,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::OutOfCache => f.write_str("ran out of slot cache"),
            FatalError::OutOfMemory => f.write_str("ran out of memory"),
            FatalError::TooFarBehind => {
                f.write_str("group is too far ahead, node must rejoin via snapshot")
            }
        }
    }
}

impl std::error::Error for FatalError {}

/// Error context: which node.
#[derive(Debug, Clone, Copy)]
pub struct NodeContext {
    pub node: NodeNo,
}

impl NodeContext {
    #[must_use]
    pub fn new(node: NodeNo) -> Self {
        Self { node }
    }
}

impl fmt::Display for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node: {}", self.node)
    }
}

/// Error context: which slot.
#[derive(Debug, Clone, Copy)]
pub struct SynodeContext {
    pub synode: Synode,
}

impl SynodeContext {
    #[must_use]
    pub fn new(synode: Synode) -> Self {
        Self { synode }
    }
}

impl fmt::Display for SynodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "synode: {}", self.synode)
    }
}

/// Error context: what operation was in progress.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation: &'static str,
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "while {}", self.operation)
    }
}

impl OperationContext {
    pub const PROPOSING: Self = Self {
        operation: "driving a proposal",
    };
    pub const DELIVERING: Self = Self {
        operation: "delivering to the application",
    };
    pub const RECONFIGURING: Self = Self {
        operation: "applying a reconfiguration",
    };
    pub const INSTALLING_SNAPSHOT: Self = Self {
        operation: "installing a snapshot",
    };
    pub const BOOTING: Self = Self {
        operation: "booting the group",
    };
    pub const CONNECTING: Self = Self {
        operation: "connecting to a peer",
    };
}

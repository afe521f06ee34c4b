pub mod records;

use records::RecordPoint;

/// Identifier of an algorithm instance inside its execution domain
pub type InstanceId = u32;
/// Status word returned by algorithms and carried in the message envelope
pub type AlgStatus = i32;

pub const EOK: AlgStatus = 0;
pub const EFAIL: AlgStatus = -1;
pub const EUNSUPPORTED: AlgStatus = -3;

/// Failures reported by the transport carrying messages between domains
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportError {
    /// the other side of the transport is gone
    Disconnected,
    /// transport refused to take the message
    Rejected,
    /// transport specific status, passed through unchanged
    Status(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    // caller errors
    /// argument structure missing, or its size field is below the base size of its class
    InvalidArgument,
    /// marshaled payload would not fit the negotiated message capacity
    UnsupportedSize { required: usize, capacity: usize },
    /// declared number of buffers does not match the populated slots
    MalformedBufferList { declared: usize, found: usize },
    /// a call is already outstanding on the handle
    CallOutstanding,
    /// wait was called without an outstanding asynchronous call
    NoPendingCall,
    /// asynchronous operation requested on a handle that is not remote
    LocalHandle,
    // resource errors
    /// message pool has no free message
    AllocationFailed,
    /// buffer address could not be made addressable in the other domain
    TranslationFailed { slot: usize },
    /// memory domain could not provide a region of the requested size
    OutOfMemory,
    /// tried to read outside of a memory region
    InvalidRead,
    /// tried to write outside of a memory region
    InvalidWrite,
    // protocol errors
    /// message contents do not describe a valid layout
    MalformedMessage,
    /// reply belongs to a different command than the one that was waited for
    ReplyMismatch { expected: u32, found: u32 },
    /// transport failure, passed through verbatim
    Transport(TransportError),
    // ambient errors
    /// configuration could not be read or is inconsistent
    ConfigError(String),
    /// call to record timestamps were not called in order
    RecordSequencingFailure(RecordPoint, RecordPoint),
}

impl RemoteError {
    /// Status word equivalent for callers that only look at status codes
    pub fn status_code(&self) -> AlgStatus {
        return match self {
            RemoteError::UnsupportedSize { .. } => EUNSUPPORTED,
            RemoteError::Transport(TransportError::Status(status)) => *status,
            _ => EFAIL,
        };
    }
}

impl From<TransportError> for RemoteError {
    fn from(err: TransportError) -> Self {
        RemoteError::Transport(err)
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Callee broke a guarantee of the calling convention.
/// These are reported after the call completed and never change its result.
#[derive(Debug, Clone, PartialEq)]
pub enum ContractViolation {
    /// read-only argument structure differs from its snapshot, first differing byte
    ReadOnlyViolation { structure: &'static str, offset: usize },
    /// callee rewrote the size field of the out arguments
    OutArgsSizeChanged { expected: usize, found: usize },
    /// callee rewrote the size field of the status structure
    StatusSizeChanged { expected: usize, found: usize },
    /// callee changed the declared capacity of the status buffer
    StatusBufferChanged { expected: usize, found: usize },
}

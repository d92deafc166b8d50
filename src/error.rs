use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid trace metadata. {0}")]
    Metadata(String),

    #[error("The {0} is frozen and can no longer be modified")]
    Frozen(&'static str),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("The graph has been canceled")]
    Canceled,

    #[error("The downstream component refused the port connection. {0}")]
    PortRefused(String),

    #[error("The graph cannot be modified while a listener is running")]
    InListener,

    #[error("No such {kind} '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("Unsupported operation. {0}")]
    Unsupported(&'static str),

    #[error("Graph error. {0}")]
    Graph(String),

    #[error("Component error. {0}")]
    Component(String),
}

/// Failure to resolve a variant tag or sequence length path to a field
/// appearing earlier in decode order.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ResolutionError {
    #[error("Path '{0}' does not name a field in any reachable scope")]
    TargetNotFound(String),

    #[error("Path '{0}' resolves to a field that is not an integer or enumeration")]
    TargetNotInteger(String),

    #[error("Path '{0}' resolves to a field that appears later in decode order")]
    TargetNotEarlier(String),

    #[error("Path '{0}' names an unknown scope")]
    UnknownScope(String),
}

/// Fatal decoding failures. Any of these is terminal for the iterator
/// that produced it; subsequent calls return end-of-iteration.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("The medium returned end-of-stream in the middle of a packet (at bit {at})")]
    UnexpectedEof { at: usize },

    #[error("The medium failed. {0}")]
    Medium(String),

    #[error("Invalid packet header magic number: expected 0x{expected:x}, got 0x{found:x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("Packet header UUID {found} does not match the trace UUID {expected}")]
    UuidMismatch {
        expected: uuid::Uuid,
        found: uuid::Uuid,
    },

    #[error("No stream class with ID {0} in the trace")]
    NoSuchStreamClass(u64),

    #[error(
        "Packet refers to stream class {found} but this packet sequence started with stream class {expected}"
    )]
    StreamClassMismatch { expected: u64, found: u64 },

    #[error("The medium returned a different stream than the previous one for the same packet sequence")]
    StreamMismatch,

    #[error("No event class with ID {0} in the stream class")]
    NoSuchEventClass(u64),

    #[error("Invalid packet size: {0}")]
    InvalidPacketSize(String),

    #[error("Cursor is past the packet content (at bit {at}, content size {content_size} bits)")]
    ContentOverrun { at: usize, content_size: usize },

    #[error("Field decoding failed. {0}")]
    Field(String),

    #[error("Variant tag value {0} selects no option")]
    NoVariantOption(u64),

    /// The decoder's internal bookkeeping no longer matches its state
    /// machine. Terminal for the iterator that reports it.
    #[error("The decoder state is inconsistent: {0}")]
    Poisoned(&'static str),
}

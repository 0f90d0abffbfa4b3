use thiserror::Error;

/// Failures raised while building or reading protocol frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid tag id: {0}")]
    InvalidTagId(String),

    #[error("invalid hex text: {0}")]
    InvalidHex(String),

    #[error("declared length {size} exceeds field capacity {max}")]
    LengthOverflow { size: usize, max: usize },

    #[error("batch of {count} entities exceeds {max}")]
    TooManyEntities { count: usize, max: usize },

    /// Group slots must be unique and below the bitmap width.
    #[error("group index {index} rejected")]
    GroupIndex { index: u8 },

    #[error("empty frame")]
    EmptyFrame,

    #[error("frame length field unreadable: {0}")]
    LengthField(String),

    #[error("node {node} field `{field}` unreadable")]
    Node { node: usize, field: &'static str },

    #[error("discarded {len} bytes outside a frame")]
    Unframed { len: usize },

    #[error("reassembly buffer size {size} exceeds max {max}")]
    OversizedBuffer { size: usize, max: usize },
}

/// Registration handshake rejects, with the byte offset that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("handshake too short: {len} bytes")]
    TooShort { len: usize },

    #[error("handshake is not ascii")]
    NotAscii,

    #[error("unexpected byte at offset {offset}")]
    Unexpected { offset: usize },
}

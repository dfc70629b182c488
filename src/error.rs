use thiserror::Error;

/// Errors arising from normalizing a wire payload into a shot record.
///
/// All of these are per-message: the offending message is logged and
/// dropped, and the pipeline keeps processing.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("array payload too short: expected at least {need} elements, got {got}")]
    ArrayTooShort { need: usize, got: usize },

    #[error("array element [{index}] has wrong type: expected {expected}")]
    BadArrayField { index: usize, expected: &'static str },

    #[error("map key {key:?} has wrong type: expected {expected}")]
    BadMapField { key: &'static str, expected: &'static str },

    #[error("payload is not a shot message (expected msgpack array or map)")]
    NotShotShaped,

    #[error("malformed msgpack payload: {0}")]
    Msgpack(#[from] rmpv::decode::Error),

    #[error("trailing bytes after msgpack value ({extra} extra)")]
    ExtraData { extra: usize },
}

/// Errors arising from the STOMP frame codec and broker session.
#[derive(Debug, Error)]
pub enum StompError {
    #[error("frame missing NUL body terminator")]
    MissingNul,

    #[error("malformed command line: {0:?}")]
    BadCommand(String),

    #[error("malformed header line: {0:?}")]
    BadHeader(String),

    #[error("invalid content-length header: {0:?}")]
    BadContentLength(String),

    #[error("invalid header escape sequence \\{0}")]
    BadEscape(char),

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("expected CONNECTED frame, got {0:?}")]
    UnexpectedFrame(String),

    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

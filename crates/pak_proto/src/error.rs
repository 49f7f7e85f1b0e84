use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown frame kind {0}")]
    UnknownKind(u8),

    #[error("Truncated frame: {0}")]
    Truncated(&'static str),

    #[error("Field too long: {0}")]
    FieldTooLong(&'static str),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Malformed fragment: {0}")]
    MalformedFragment(String),

    #[error("MTU {0} too small to carry a fragment")]
    MtuTooSmall(usize),

    #[error("Relay envelope id does not match its contents")]
    MessageIdMismatch,

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

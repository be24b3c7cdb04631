use std::str::Utf8Error;

/// Count of attempts to send or receive a packet before giving up.
pub const MAX_RETRANSMITS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error("debug stub executable unavailable: {0}")]
    StubNotFound(#[from] which::Error),
    #[error("program is not being started")]
    ProcessNotStarted,

    // --------------------------------- transport errors ------------------------------------------
    #[error("connection closed by remote stub")]
    ConnectionClosed,
    #[error("invalid ack byte: {0:#04x}")]
    InvalidAck(u8),
    #[error("malformed checksum field: {0:?}")]
    MalformedChecksum(String),
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),
    #[error("failed to send {cmd} after {MAX_RETRANSMITS} attempts")]
    SendRetriesExceeded { cmd: String },
    #[error("failed to receive a reply to {cmd} after {MAX_RETRANSMITS} attempts")]
    RecvRetriesExceeded { cmd: String },

    // --------------------------------- protocol errors -------------------------------------------
    #[error("remote command {cmd} failed with code {code}")]
    Protocol { cmd: String, code: String },
    #[error("unknown stop reply: {0}")]
    UnknownStopReply(String),
    #[error("unexpected file response: {0}")]
    FileResponse(String),
    #[error("remote file operation failed: {0}")]
    FileOperation(String),
    #[error("unexpected length of file response: {0}")]
    FileResponseLength(String),

    // --------------------------------- symbol lookup errors --------------------------------------
    #[error("file {0} not found in debug information")]
    FileNotFound(String),
    #[error("location {file}:{line} not found")]
    LocationNotFound { file: String, line: u64 },
    #[error("location {location} is ambiguous: {}", .candidates.join(", "))]
    AmbiguousLocation {
        location: String,
        candidates: Vec<String>,
    },

    // --------------------------------- session errors --------------------------------------------
    #[error("unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or stop whole session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::FileNotFound(_) => false,
            Error::LocationNotFound { .. } => false,
            Error::AmbiguousLocation { .. } => false,
            Error::ProcessNotStarted => false,

            Error::IO(_) => true,
            Error::Utf8(_) => true,
            Error::StubNotFound(_) => true,
            Error::ConnectionClosed => true,
            Error::InvalidAck(_) => true,
            Error::MalformedChecksum(_) => true,
            Error::ChecksumMismatch(_) => true,
            Error::SendRetriesExceeded { .. } => true,
            Error::RecvRetriesExceeded { .. } => true,
            Error::Protocol { .. } => true,
            Error::UnknownStopReply(_) => true,
            Error::FileResponse(_) => true,
            Error::FileOperation(_) => true,
            Error::FileResponseLength(_) => true,
            Error::UnsupportedArchitecture(_) => true,
            Error::DwarfParsing(_) => true,
            Error::ObjParsing(_) => true,
        }
    }
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", "{}", e);
                None
            }
        }
    };
    ($res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "debugger", concat!($msg, " {}"), e);
                None
            }
        }
    };
}
